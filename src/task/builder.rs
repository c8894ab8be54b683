// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::Schedule;
use crate::task::id::Id;
use crate::task::join_handle::JoinHandle;
use crate::task::{Task, TaskRef};
use core::any::type_name;
use core::future::Future;
use core::panic::Location;

/// Builds task allocations for a scheduler.
///
/// The builder records the scheduler handle woken tasks are handed back to,
/// and stamps each task with a tracing span carrying its id, output type and
/// spawn location.
pub(crate) struct TaskBuilder<S> {
    scheduler: S,
}

impl<S> TaskBuilder<S>
where
    S: Schedule,
{
    pub(crate) const fn new(scheduler: S) -> Self {
        Self { scheduler }
    }

    /// Allocate a task for `future`, returning the [`TaskRef`] to enqueue and
    /// the [`JoinHandle`] to hand to the caller.
    ///
    /// The returned task is not yet scheduled; the caller decides which run
    /// queue it lands on first.
    #[inline]
    #[track_caller]
    pub(crate) fn build<F>(self, future: F) -> (TaskRef, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = Id::next();

        let loc = Location::caller();
        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.output = %type_name::<F::Output>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        let task = Box::new(Task::new(future, id, self.scheduler, span));
        TaskRef::new_allocated(task)
    }
}
