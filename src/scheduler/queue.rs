// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-worker run queue: a bounded work-stealing deque.
//!
//! Each worker owns the [`Local`] half of its queue and is the only one
//! allowed to push; it pushes to and pops from the *tail*. Every other worker
//! holds a [`Steal`] half and takes tasks from the *head* by CAS-advancing
//! it. Both indices increase monotonically (wrapping); a slot is occupied iff
//! its logical index lies in `[head, tail)`.
//!
//! The owner side is wait-free except for the single-element case, where the
//! owner races stealers with one CAS on `head`. A full queue never blocks:
//! the caller overflows the rejected task into the global injection queue.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{self, AtomicUsize, Ordering};
use crate::loom::sync::Arc;
use crate::task::TaskRef;
use core::mem::{self, MaybeUninit};

/// The owner half of a run queue. Only the worker that owns the queue may
/// push to or pop from it.
pub(crate) struct Local {
    inner: Arc<Inner>,
}

/// A handle that other workers use to steal from a queue's head.
#[derive(Clone)]
pub(crate) struct Steal {
    inner: Arc<Inner>,
}

struct Inner {
    /// The stealer end. Read by anyone, advanced with CAS.
    head: AtomicUsize,
    /// The owner end. Written only by the owner (with one exception in
    /// `pop`, which speculatively claims the slot below it).
    tail: AtomicUsize,
    buffer: Box<[UnsafeCell<MaybeUninit<TaskRef>>]>,
}

// Safety: access to the buffer slots is mediated by the head/tail protocol;
// a slot is written only while unoccupied and read only by whoever claimed it
unsafe impl Send for Inner {}
// Safety: see above
unsafe impl Sync for Inner {}

/// Create a new run queue of the given capacity (which must be a power of
/// two), returning its two halves.
pub(crate) fn local(capacity: usize) -> (Steal, Local) {
    assert!(
        capacity.is_power_of_two(),
        "run queue capacity must be a power of two"
    );

    let buffer = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();

    let inner = Arc::new(Inner {
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        buffer,
    });

    (
        Steal {
            inner: inner.clone(),
        },
        Local { inner },
    )
}

// === impl Local ===

impl Local {
    pub(crate) fn capacity(&self) -> usize {
        self.inner.buffer.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.capacity() - 1
    }

    /// How many more tasks fit before `push_back` starts rejecting.
    pub(crate) fn spare_capacity(&self) -> usize {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        self.capacity() - tail.wrapping_sub(head)
    }

    pub(crate) fn is_empty(&self) -> bool {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        tail == head
    }

    /// Push a task onto the tail of the queue.
    ///
    /// Returns the task back when the queue is full; the caller must then
    /// overflow it into the injection queue (a worker never blocks on its own
    /// queue).
    pub(crate) fn push_back(&self, task: TaskRef) -> Result<(), TaskRef> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.capacity() {
            return Err(task);
        }

        // Safety: the slot at `tail` is unoccupied, and only the owner
        // writes. Stealers cannot observe it until the tail store below.
        self.inner.buffer[tail & self.mask()]
            .with_mut(|slot| unsafe { slot.write(MaybeUninit::new(task)) });

        // publish the slot
        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop a task from the tail of the queue.
    ///
    /// For the last remaining element this races concurrent stealers with a
    /// single CAS on `head`; everywhere else the owner side is wait-free.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        // speculatively claim the slot below the tail
        let tail = self.inner.tail.load(Ordering::Relaxed).wrapping_sub(1);
        self.inner.tail.store(tail, Ordering::Relaxed);

        // the store above must be visible to stealers before we read `head`,
        // and symmetrically for their CAS
        atomic::fence(Ordering::SeqCst);

        let head = self.inner.head.load(Ordering::Relaxed);

        if (tail.wrapping_sub(head) as isize) < 0 {
            // the queue was empty, restore the tail
            self.inner.tail.store(tail.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        // Safety: the slot at `tail` is occupied. Stealers may concurrently
        // read it only in the single-element case, which is resolved by the
        // CAS below; the read itself is non-mutating.
        let task = self.inner.buffer[tail & self.mask()]
            .with(|slot| unsafe { (*slot).assume_init_ref().clone_unchecked() });

        if tail != head {
            // more than one element, the claimed slot is exclusively ours
            return Some(task);
        }

        // last element: whoever advances `head` owns it
        let won = self
            .inner
            .head
            .compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok();

        // the queue is now empty either way; put the tail back above head
        self.inner
            .tail
            .store(tail.wrapping_add(1), Ordering::Relaxed);

        if won {
            Some(task)
        } else {
            // a stealer got it first; the copied reference is theirs
            mem::forget(task);
            None
        }
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        // by the time the owner half is dropped the workers are gone, so any
        // remaining tasks can be drained without synchronization
        while let Some(task) = self.pop() {
            drop(task);
        }
    }
}

// === impl Steal ===

impl Steal {
    /// A snapshot of the number of queued tasks. Only ever advisory, the
    /// queue may change concurrently.
    pub(crate) fn len(&self) -> usize {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Acquire);
        (tail.wrapping_sub(head) as isize).max(0) as usize
    }

    /// Steal a single task from the head of the queue.
    pub(crate) fn steal_one(&self) -> Option<TaskRef> {
        loop {
            let head = self.inner.head.load(Ordering::Acquire);
            let tail = self.inner.tail.load(Ordering::Acquire);

            if (tail.wrapping_sub(head) as isize) <= 0 {
                return None;
            }

            // Safety: the slot at `head` cannot be overwritten while `head`
            // itself has not advanced (the owner's capacity check keeps the
            // write index strictly below `head + capacity`), so this read is
            // stable. Ownership of the reference is only assumed if the CAS
            // below succeeds.
            let task = self.inner.buffer[head & (self.inner.buffer.len() - 1)]
                .with(|slot| unsafe { (*slot).assume_init_ref().clone_unchecked() });

            match self.inner.head.compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(task),
                Err(_) => {
                    // lost the race, the reference belongs to someone else
                    mem::forget(task);
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Steal up to `max` tasks, moving all but the first into `dst` and
    /// returning the first for the caller to run directly.
    ///
    /// Must be called from the thread owning `dst`.
    pub(crate) fn steal_into(&self, dst: &Local, max: usize) -> Option<TaskRef> {
        // cap by the destination's free space up front: only its owner (the
        // calling thread) can shrink it, so this cannot go stale under us
        let max = max.min(dst.spare_capacity() + 1);

        let mut first = None;
        let mut stolen = 0;

        while stolen < max {
            let Some(task) = self.steal_one() else { break };

            if first.is_none() {
                first = Some(task);
            } else if let Err(task) = dst.push_back(task) {
                // can't happen per the cap above, but never lose a task
                debug_assert!(false, "stolen task did not fit the destination queue");
                first = Some(task);
                break;
            }
            stolen += 1;
        }

        first
    }

    /// Steal half of the victim's queue (rounded up), per the balancing
    /// policy: after the steal both sides hold roughly equal counts.
    pub(crate) fn steal_half_into(&self, dst: &Local) -> Option<TaskRef> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        self.steal_into(dst, len - len / 2)
    }
}

impl TaskRef {
    /// Duplicates the pointer *without* touching the reference count.
    ///
    /// # Safety
    ///
    /// The caller must either `mem::forget` the original (transferring the
    /// reference), or `mem::forget` the copy if it turns out it doesn't own
    /// it after all. Exactly one of the two may be dropped.
    unsafe fn clone_unchecked(&self) -> TaskRef {
        unsafe { core::ptr::read(self) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::scheduler::test_support::new_detached_task;

    #[test]
    fn push_pop_fifo_steal_order() {
        loom::model(|| {
            let (steal, local) = local(4);

            let a = new_detached_task();
            let b = new_detached_task();
            let a_id = a.id();
            let b_id = b.id();

            local.push_back(a).unwrap();
            local.push_back(b).unwrap();

            // the owner pops from the tail (newest first)
            assert_eq!(local.pop().unwrap().id(), b_id);
            // stealers take from the head (oldest first)
            assert_eq!(steal.steal_one().unwrap().id(), a_id);
            assert!(local.pop().is_none());
            assert!(steal.steal_one().is_none());
        });
    }

    #[test]
    fn full_queue_rejects() {
        loom::model(|| {
            let (_steal, local) = local(2);

            local.push_back(new_detached_task()).unwrap();
            local.push_back(new_detached_task()).unwrap();

            let overflow = local.push_back(new_detached_task());
            assert!(overflow.is_err());
            drop(overflow);
        });
    }

    // Exactly one side may win the last element; the queue capacity is large
    // enough that the buffer never wraps during the model run.
    #[test]
    fn pop_races_steal() {
        loom::model(|| {
            let (steal, local) = local(4);
            local.push_back(new_detached_task()).unwrap();

            let thief = loom::thread::spawn(move || steal.steal_one().is_some());

            let popped = local.pop().is_some();
            let stolen = thief.join().unwrap();

            assert!(
                popped ^ stolen,
                "exactly one of pop/steal must win (popped={popped}, stolen={stolen})"
            );
        });
    }

    #[test]
    fn steal_half_balances() {
        loom::model(|| {
            let (steal, victim) = local(8);
            let (_s2, dst) = local(8);

            for _ in 0..4 {
                victim.push_back(new_detached_task()).unwrap();
            }

            let first = steal.steal_half_into(&dst);
            assert!(first.is_some());
            // 2 of 4 stolen: one returned, one landed in dst
            assert_eq!(steal.len(), 2);
            assert!(dst.pop().is_some());
            assert!(dst.pop().is_none());
            drop(first);
        });
    }

    // never-polled tasks still in the queue must have their references
    // released on drop (loom's leak checker verifies the deallocation)
    #[test]
    fn dropping_local_releases_tasks() {
        loom::model(|| {
            let (_steal, local) = local(4);
            local.push_back(new_detached_task()).unwrap();
            local.push_back(new_detached_task()).unwrap();
            drop(local);
        });
    }
}
