// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicU8, Ordering};
use crate::util::loom_const_fn;
use core::fmt;
use core::hint;
use core::task::{Context, Poll, Waker};

/// Hands one task's [`Waker`] to one notification source.
///
/// A `WaitCell` carries at most one pending notification. [`wake`] delivers
/// it, invoking the registered waker if there is one; the next [`poll_wait`]
/// by the waiting task consumes it. A notification is never lost: one that
/// arrives before any waker is registered, or while the waker is still being
/// written, is latched and handed to the waiting task on its next poll.
///
/// Only a single task may wait on a cell (in this crate: the future owning a
/// reactor operation). Any number of threads may deliver notifications.
///
/// [`wake`]: Self::wake
/// [`poll_wait`]: Self::poll_wait
pub struct WaitCell {
    state: AtomicU8,
    waker: UnsafeCell<Option<Waker>>,
}

// The cell is a five-state machine; WRITING and WAKING are short-lived locks
// on the waker slot, held by the waiting task and a notifier respectively.
/// No waker, no notification.
const EMPTY: u8 = 0;
/// The waiting task is storing its waker.
const WRITING: u8 = 1;
/// A waker is stored, ready to be woken.
const FULL: u8 = 2;
/// A notifier is taking the stored waker out.
const WAKING: u8 = 3;
/// A notification is pending; the next `poll_wait` consumes it.
const NOTIFIED: u8 = 4;

// === impl WaitCell ===

impl WaitCell {
    loom_const_fn! {
        pub const fn new() -> Self {
            Self {
                state: AtomicU8::new(EMPTY),
                waker: UnsafeCell::new(None),
            }
        }
    }

    /// Register the [`Context`]'s waker to be invoked by the next [`wake`],
    /// or consume a notification that already arrived.
    ///
    /// Returns `Ready` when a notification was pending; the caller re-checks
    /// whatever condition it is waiting on and polls again if it still does
    /// not hold. Returns `Pending` once the waker is stored.
    ///
    /// [`wake`]: Self::wake
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.load(Ordering::Acquire);

        loop {
            match state {
                NOTIFIED => match self.transition(NOTIFIED, EMPTY) {
                    Ok(_) => return Poll::Ready(()),
                    Err(actual) => state = actual,
                },

                EMPTY | FULL => {
                    // lock the slot for writing
                    if let Err(actual) = self.transition(state, WRITING) {
                        state = actual;
                        continue;
                    }

                    // Safety: WRITING grants this task exclusive slot access
                    self.waker.with_mut(|slot| unsafe {
                        match &mut *slot {
                            Some(old) if old.will_wake(cx.waker()) => {}
                            slot => *slot = Some(cx.waker().clone()),
                        }
                    });

                    match self.transition(WRITING, FULL) {
                        Ok(_) => return Poll::Pending,
                        Err(actual) => {
                            debug_assert_eq!(
                                actual, NOTIFIED,
                                "only a notifier may interrupt a registration"
                            );
                            // a notification arrived while we were writing;
                            // the notifier left the slot to us, so reclaim
                            // the waker (nobody will invoke it) and report
                            // the notification directly.
                            // Safety: the interrupted registration still
                            // holds the slot
                            self.waker.with_mut(|slot| unsafe {
                                *slot = None;
                            });
                            self.state.store(EMPTY, Ordering::Release);
                            return Poll::Ready(());
                        }
                    }
                }

                WAKING => {
                    // a notifier has the slot; it will store NOTIFIED in a
                    // few instructions
                    hint::spin_loop();
                    state = self.state.load(Ordering::Acquire);
                }

                WRITING => unreachable!("a WaitCell supports only one waiting task"),
                state => unreachable!("invalid wait cell state {state}"),
            }
        }
    }

    /// Deliver a notification: invokes the registered waker if there is one,
    /// and latches the notification either way so the waiting task's next
    /// [`poll_wait`] observes it.
    ///
    /// Returns `true` if a stored waker was invoked.
    ///
    /// [`poll_wait`]: Self::poll_wait
    pub fn wake(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);

        loop {
            match state {
                FULL => {
                    // lock the slot for taking the waker out
                    if let Err(actual) = self.transition(FULL, WAKING) {
                        state = actual;
                        continue;
                    }

                    // Safety: WAKING grants this notifier exclusive slot
                    // access
                    let waker = self.waker.with_mut(|slot| unsafe { (*slot).take() });

                    // latch before waking: the woken task may poll from
                    // another thread right away and must find the token
                    self.state.store(NOTIFIED, Ordering::Release);

                    if let Some(waker) = waker {
                        waker.wake();
                    }
                    return true;
                }

                EMPTY | WRITING => {
                    // no waker to invoke (or it is mid-registration, and the
                    // writer checks for exactly this): latch the token
                    match self.transition(state, NOTIFIED) {
                        Ok(_) => return false,
                        Err(actual) => state = actual,
                    }
                }

                // already notified, or a concurrent notifier is delivering
                NOTIFIED | WAKING => return false,

                state => unreachable!("invalid wait cell state {state}"),
            }
        }
    }

    #[inline(always)]
    fn transition(&self, from: u8, to: u8) -> Result<u8, u8> {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
    }
}

// Safety: the slot is only touched under the WRITING/WAKING states, which
// act as a lock
unsafe impl Send for WaitCell {}
// Safety: see above
unsafe impl Sync for WaitCell {}

impl Default for WaitCell {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitCell {
    fn drop(&mut self) {
        // release a still-registered waker without invoking it; `&mut self`
        // means no notifier can be active
        self.waker.with_mut(|slot| unsafe {
            *slot = None;
        });
    }
}

impl fmt::Debug for WaitCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Relaxed) {
            EMPTY => "Empty",
            WRITING => "Writing",
            FULL => "Full",
            WAKING => "Waking",
            NOTIFIED => "Notified",
            _ => "<invalid>",
        };
        f.debug_struct("WaitCell").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::thread;
    use crate::test_util::noop_waker;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, StdOrdering::Relaxed);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, StdOrdering::Relaxed);
        }
    }

    #[test]
    fn notification_latches_before_registration() {
        loom::model(|| {
            let cell = WaitCell::new();

            // nothing is registered yet, the token is latched
            assert!(!cell.wake());

            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(()));

            // the token was consumed, the next poll registers
            assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);
        });
    }

    #[test]
    fn wake_invokes_registered_waker_once() {
        let target = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(target.clone());
        let mut cx = Context::from_waker(&waker);

        let cell = WaitCell::new();
        assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);

        assert!(cell.wake());
        assert_eq!(target.0.load(StdOrdering::Relaxed), 1);

        // the waker was consumed by the wake; the token remains for the
        // woken task, and further wakes coalesce
        assert!(!cell.wake());
        assert_eq!(target.0.load(StdOrdering::Relaxed), 1);
        assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(()));
    }

    #[test]
    fn dropping_releases_waker_without_waking() {
        let target = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(target.clone());
        let mut cx = Context::from_waker(&waker);

        let cell = WaitCell::new();
        assert_eq!(cell.poll_wait(&mut cx), Poll::Pending);
        drop(cell);

        assert_eq!(target.0.load(StdOrdering::Relaxed), 0);
    }

    #[test]
    fn racing_wake_is_never_lost() {
        loom::model(|| {
            let cell = Arc::new(WaitCell::new());

            let notifier = {
                let cell = cell.clone();
                thread::spawn(move || {
                    cell.wake();
                })
            };

            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            let first = cell.poll_wait(&mut cx);

            notifier.join().unwrap();

            // whichever way the race went, the notification must be
            // observable by now
            if first.is_pending() {
                assert_eq!(cell.poll_wait(&mut cx), Poll::Ready(()));
            }
        });
    }
}
