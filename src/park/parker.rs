// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::Arc;
use crate::park::Park;
use core::task::{RawWaker, RawWakerVTable, Waker};
use static_assertions::assert_impl_all;

/// A cloneable handle to a [`Park`] implementation.
///
/// The thread that owns the underlying `Park` parks through this; everyone
/// else gets an [`UnparkToken`] (or a [`Waker`] derived from one) to wake it
/// back up.
#[derive(Debug)]
pub(crate) struct Parker<P>(Arc<P>);

#[derive(Debug, Clone)]
pub(crate) struct UnparkToken<P>(Parker<P>);
assert_impl_all!(UnparkToken<crate::park::StdPark>: Send, Sync);

// === impl Parker ===

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Park> Parker<P> {
    pub(crate) fn new(park_impl: P) -> Self {
        Self(Arc::new(park_impl))
    }

    #[inline]
    pub(crate) fn park(&self) {
        self.0.park();
    }

    /// Convert this [`Parker`] into an [`UnparkToken`] which can be used to
    /// wake up the parked thread.
    #[inline]
    pub(crate) fn into_unpark(self) -> UnparkToken<P> {
        UnparkToken(self)
    }
}

// === impl UnparkToken ===

impl<P: Park> UnparkToken<P> {
    /// Unpark the target thread (or make its next park return immediately).
    #[inline]
    pub(crate) fn unpark(&self) {
        self.0 .0.unpark();
    }

    /// Convert self into a `Waker` that wakes the target thread when invoked.
    #[inline]
    pub(crate) fn into_waker(self) -> Waker {
        // Safety: the vtable functions below uphold the RawWaker contract
        unsafe {
            let raw = Self::into_raw_waker(self.0 .0);
            Waker::from_raw(raw)
        }
    }

    fn into_raw(this: Arc<P>) -> *const () {
        Arc::into_raw(this).cast::<()>()
    }

    unsafe fn from_raw(ptr: *const ()) -> Arc<P> {
        // Safety: ensured by caller
        unsafe { Arc::from_raw(ptr.cast::<P>()) }
    }

    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::waker_clone,
        Self::waker_wake,
        Self::waker_wake_by_ref,
        Self::waker_drop,
    );

    unsafe fn waker_clone(raw: *const ()) -> RawWaker {
        // Safety: ensured by the vtable contract
        unsafe {
            Arc::increment_strong_count(raw.cast::<P>());
            Self::into_raw_waker(Self::from_raw(raw))
        }
    }

    unsafe fn waker_drop(raw: *const ()) {
        // Safety: ensured by the vtable contract
        unsafe {
            drop(Self::from_raw(raw));
        }
    }

    unsafe fn waker_wake(raw: *const ()) {
        // Safety: ensured by the vtable contract
        let park = unsafe { Self::from_raw(raw) };
        park.unpark();
    }

    unsafe fn waker_wake_by_ref(raw: *const ()) {
        let park = raw.cast::<P>();
        // Safety: ensured by the vtable contract
        unsafe {
            (*park).unpark();
        }
    }

    // `Waker::will_wake` is used all over the place to optimize waker code
    // (e.g. only update wakers if they have a different wake target). Problem
    // is `will_wake` only checks for pointer equality and since
    // `into_raw_waker` would usually be inlined in release mode (and with it
    // `WAKER_VTABLE`) the waker identity would be different before and after
    // calling `.clone()`. This isn't a correctness problem since it's still
    // the same waker in the end, it just causes a lot of unnecessary wake
    // ups. The `inline(never)` below is therefore quite load-bearing.
    #[inline(never)]
    fn into_raw_waker(this: Arc<P>) -> RawWaker {
        RawWaker::new(Self::into_raw(this), &Self::WAKER_VTABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use crate::loom::sync::mpsc;
    use crate::loom::thread;
    use crate::park::StdPark;
    use core::future::Future;
    use core::pin::{pin, Pin};
    use core::task::{Context, Poll, Waker};

    #[test]
    fn parking_basically_works() {
        // Thread A parks itself through `Parker::park` after sending an
        // `UnparkToken` to thread B, which uses it to wake A back up.
        loom::model(|| {
            loom::lazy_static! {
                static ref A_UNPARKED: AtomicBool = AtomicBool::new(false);
            }
            let (tx, rx) = mpsc::channel();

            let a = thread::spawn(move || {
                let parker = Parker::new(StdPark::new());

                tx.send(parker.clone().into_unpark()).unwrap();

                parker.park();

                A_UNPARKED.store(true, Ordering::Release);
            });

            let b = thread::spawn(move || {
                let unpark = rx.recv().unwrap();
                unpark.unpark();
            });

            let _ = a.join();
            let _ = b.join();

            assert!(A_UNPARKED.load(Ordering::Acquire));
        });
    }

    #[test]
    fn waker() {
        // The same as above, but through the Waker indirection and a
        // simulated future poll loop.
        loom::model(|| {
            loom::lazy_static! {
                static ref NUM_POLLS: AtomicUsize = AtomicUsize::new(0);
                static ref COMPLETED: AtomicBool = AtomicBool::new(false);
            }

            let (tx, rx) = mpsc::channel();

            let a = thread::spawn(move || {
                struct Yield {
                    done: bool,
                    tx: mpsc::Sender<Waker>,
                }
                impl Future for Yield {
                    type Output = ();

                    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                        if !self.done {
                            self.done = true;
                            self.tx.send(cx.waker().clone()).unwrap();
                            Poll::Pending
                        } else {
                            Poll::Ready(())
                        }
                    }
                }

                let parker = Parker::new(StdPark::new());
                let waker = parker.clone().into_unpark().into_waker();

                let mut cx = Context::from_waker(&waker);
                let mut future = pin!(Yield { done: false, tx });

                loop {
                    NUM_POLLS.fetch_add(1, Ordering::Release);
                    if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
                        COMPLETED.store(true, Ordering::Release);
                        return v;
                    }

                    parker.park();
                }
            });

            let b = thread::spawn(move || {
                let waker = rx.recv().unwrap();
                waker.wake();
            });

            let _ = a.join();
            let _ = b.join();

            assert!(COMPLETED.load(Ordering::Acquire));
            assert_eq!(NUM_POLLS.load(Ordering::Acquire), 2);
        });
    }
}
