// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker-local scheduling state and the [`Schedule`] seam between tasks and
//! whatever runs them.

pub(crate) mod injector;
pub(crate) mod queue;

use crate::scheduler::injector::Injector;
use crate::task::TaskRef;
use core::cell::Cell;
use core::fmt;

/// The scheduler seam a task hands itself back through when it is woken.
///
/// A task captures one of these at spawn time; its waker calls
/// [`schedule`](Self::schedule) to re-enqueue the task. In production this is
/// the runtime handle; tests substitute lighter implementations.
pub(crate) trait Schedule: Clone + Send + Sync + 'static {
    /// Place a woken task back onto a run queue.
    ///
    /// Implementations must guarantee the task is polled at least once after
    /// this call (no lost wakes), unless the runtime is shutting down.
    fn schedule(&self, task: TaskRef);
}

/// Statistics for one stretch of uninterrupted work on a worker, logged when
/// the worker runs dry and parks.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Tick {
    /// The number of tasks polled.
    pub(crate) polled: usize,
    /// The number of polled tasks that completed. Always <= `polled`.
    pub(crate) completed: usize,
    /// The number of tasks obtained by stealing from siblings or the
    /// injection queue.
    pub(crate) stolen: usize,
}

/// The parts of a worker that its own thread *and* wakers running on that
/// thread touch: the owner half of the run queue and the LIFO slot.
///
/// A `Core` is owned by exactly one worker thread. Wakers reach it through a
/// thread-local pointer (see `runtime::context`), so every access happens on
/// the owning thread and plain `Cell`s suffice.
pub(crate) struct Core {
    index: usize,
    run_queue: queue::Local,
    /// One-element fast path: a task woken from this worker is placed here
    /// and run next, ahead of the local queue. This keeps wake-to-run latency
    /// low for producer/consumer pairs living on the same worker.
    lifo_slot: Cell<Option<TaskRef>>,
    lifo_enabled: bool,
}

// === impl Core ===

impl Core {
    pub(crate) fn new(index: usize, run_queue: queue::Local, lifo_enabled: bool) -> Self {
        Self {
            index,
            run_queue,
            lifo_slot: Cell::new(None),
            lifo_enabled,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn run_queue(&self) -> &queue::Local {
        &self.run_queue
    }

    /// Take the task parked in the LIFO slot, if any.
    pub(crate) fn take_lifo(&self) -> Option<TaskRef> {
        self.lifo_slot.take()
    }

    /// Pop from the tail of the local queue.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        self.run_queue.pop()
    }

    pub(crate) fn has_work(&self) -> bool {
        // `Cell<Option<_>>` has no `is_some`; peek by take/put-back, which is
        // fine since only this thread touches the slot
        let lifo = self.lifo_slot.take();
        let has_lifo = lifo.is_some();
        self.lifo_slot.set(lifo);

        has_lifo || !self.run_queue.is_empty()
    }

    /// Place a task *woken from this worker*: into the LIFO slot, evicting
    /// any prior occupant to the back of the local queue.
    pub(crate) fn schedule_woken(&self, task: TaskRef, injector: &Injector) {
        if !self.lifo_enabled {
            self.push_back_or_overflow(task, injector);
            return;
        }

        if let Some(evicted) = self.lifo_slot.replace(Some(task)) {
            tracing::trace!(
                worker = self.index,
                "LIFO slot occupied, evicting prior task"
            );
            self.push_back_or_overflow(evicted, injector);
        }
    }

    /// Push a task to the back of the local queue, overflowing to the global
    /// injection queue when full. Never blocks.
    pub(crate) fn push_back_or_overflow(&self, task: TaskRef, injector: &Injector) {
        if let Err(task) = self.run_queue.push_back(task) {
            tracing::trace!(
                worker = self.index,
                "local queue full, overflowing to injector"
            );
            injector.push(task);
        }
    }

    /// Tear down any tasks still queued on this core: cancel them, complete
    /// the cancellation, and release their queue references.
    pub(crate) fn shutdown(&self) {
        if let Some(task) = self.take_lifo() {
            task.shutdown();
        }
        while let Some(task) = self.pop() {
            task.shutdown();
        }
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("index", &self.index)
            .field("lifo_enabled", &self.lifo_enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Schedule;
    use crate::task::{TaskBuilder, TaskRef};

    /// A scheduler that drops woken tasks on the floor; fine for queue tests
    /// where nothing is ever polled.
    #[derive(Clone, Debug)]
    pub(crate) struct NoopSchedule;

    impl Schedule for NoopSchedule {
        fn schedule(&self, task: TaskRef) {
            drop(task);
        }
    }

    /// Allocates a task (with its `JoinHandle` immediately detached) for
    /// tests that only shuffle `TaskRef`s through queues.
    pub(crate) fn new_detached_task() -> TaskRef {
        let (task, join) = TaskBuilder::new(NoopSchedule).build(async {});
        drop(join);
        task
    }
}
