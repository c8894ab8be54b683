// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The global injection queue.
//!
//! An unbounded, intrusive MPSC queue of tasks: tasks link through their
//! headers, so enqueueing never allocates. It receives tasks spawned from
//! non-worker threads, overflow from full local queues, and wakes that happen
//! off-runtime (e.g. on the reactor thread).
//!
//! The underlying queue permits only one consumer at a time; [`try_steal`]
//! hands out a [`Stealer`] guard granting exclusive pop access until it is
//! dropped, which is how every worker gets to act as the consumer.
//!
//! [`try_steal`]: Injector::try_steal

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::scheduler::queue;
use crate::task::{Header, TaskRef};
use core::fmt;
use cordyceps::mpsc_queue;
use cordyceps::mpsc_queue::MpscQueue;

#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub(crate) enum TryStealError {
    /// Tasks could not be stolen because the targeted queue already has a
    /// consumer.
    Busy,
    /// No tasks were available to steal.
    Empty,
}

pub(crate) struct Injector {
    run_queue: MpscQueue<Header>,
    queued: AtomicUsize,
}

// === impl Injector ===

impl Injector {
    pub(crate) fn new() -> Self {
        Self {
            run_queue: MpscQueue::new_with_stub(TaskRef::new_stub()),
            queued: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, task: TaskRef) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.run_queue.enqueue(task);
    }

    pub(crate) fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempt to steal from this `Injector`; the returned [`Stealer`] grants
    /// exclusive access to pop from it until dropped.
    ///
    /// # Errors
    ///
    /// Returns an error when stealing is not possible, either because the
    /// queue is *empty* or because there *already is an active stealer*.
    pub(crate) fn try_steal(&self) -> Result<Stealer<'_>, TryStealError> {
        let queue = self.run_queue.try_consume().ok_or(TryStealError::Busy)?;

        if self.queued.load(Ordering::SeqCst) == 0 {
            return Err(TryStealError::Empty);
        }

        Ok(Stealer {
            queue,
            queued: &self.queued,
        })
    }
}

impl fmt::Debug for Injector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("queued", &self.len())
            .finish_non_exhaustive()
    }
}

/// Exclusive pop access to an [`Injector`], held by at most one worker at a
/// time.
pub(crate) struct Stealer<'queue> {
    queue: mpsc_queue::Consumer<'queue, Header>,
    queued: &'queue AtomicUsize,
}

impl Stealer<'_> {
    /// Pop a single task.
    pub(crate) fn pop_one(&self) -> Option<TaskRef> {
        let task = self.queue.dequeue()?;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    /// Pop up to `max` tasks and push them into the local queue `dst`.
    /// Returns the number of tasks moved.
    ///
    /// Must be called from the thread owning `dst`: the free-space cap is
    /// taken up front, and only the owner can shrink it.
    pub(crate) fn steal_into(&self, dst: &queue::Local, max: usize) -> usize {
        let max = max.min(dst.spare_capacity());
        let mut stolen = 0;

        while stolen < max {
            let Some(task) = self.pop_one() else { break };
            let pushed = dst.push_back(task);
            debug_assert!(
                pushed.is_ok(),
                "stolen task did not fit the destination queue"
            );
            stolen += 1;
        }

        stolen
    }
}
