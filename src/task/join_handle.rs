// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::runtime::coop;
use crate::task::{Id, TaskRef};
use core::any::Any;
use core::fmt;
use core::future::Future;
use core::marker::PhantomData;
use core::pin::Pin;
use core::task::{self, Context, Poll};

/// An owned permission to join a spawned task (await its termination).
///
/// A `JoinHandle` is itself a [`Future`] that resolves once the task it
/// refers to completed, was cancelled, or panicked. Dropping a `JoinHandle`
/// *detaches* the task: it keeps running in the background and its output is
/// discarded on completion.
///
/// A `JoinHandle` does not keep the task alive by itself; it holds one of the
/// task's references, but the task is driven to completion by the runtime
/// regardless of whether the handle is awaited.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct JoinHandle<T> {
    task: TaskRef,
    _output: PhantomData<T>,
}

/// Error returned by awaiting a [`JoinHandle`] whose task did not run to
/// normal completion.
pub struct JoinError<T> {
    id: Id,
    kind: JoinErrorKind,
    output: Option<T>,
}

enum JoinErrorKind {
    /// The task was cancelled before it completed.
    Cancelled {
        /// Set if the task completed *before* the cancellation was observed;
        /// in that case its output was still captured.
        completed: bool,
    },
    /// The task's poll panicked.
    Panic(Box<dyn Any + Send + 'static>),
}

// === impl JoinHandle ===

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef) -> Self {
        task.state().create_join_handle();
        Self {
            task,
            _output: PhantomData,
        }
    }

    /// Returns the [`Id`] of the task this handle refers to.
    pub fn id(&self) -> Id {
        self.task.id()
    }

    /// Abort the task this handle refers to.
    ///
    /// Cancellation is cooperative: the task is not interrupted mid-poll,
    /// instead its next scheduler visit skips the poll and drops it. Awaiting
    /// the handle after an `abort` resolves to [`JoinError`] with
    /// [`is_cancelled`](JoinError::is_cancelled) set, unless the task had
    /// already completed.
    pub fn abort(&self) {
        self.task.cancel();
    }

    /// Returns `true` when the task has finished executing (completed
    /// normally, panicked, or was cancelled).
    pub fn is_finished(&self) -> bool {
        self.task.is_complete()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        task::ready!(coop::poll_proceed(cx));

        // Safety: `T` is the output type this handle was created with, the
        // spawn functions guarantee this.
        unsafe { self.task.poll_join::<T>(cx) }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        // detach: the task keeps running, it just can no longer be joined
        self.task.state().drop_join_handle();
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.task.id())
            .finish_non_exhaustive()
    }
}

// === impl JoinError ===

impl<T> JoinError<T> {
    pub(crate) fn cancelled(completed: bool, id: Id) -> Self {
        Self {
            id,
            kind: JoinErrorKind::Cancelled { completed },
            output: None,
        }
    }

    pub(crate) fn panic(id: Id, payload: Box<dyn Any + Send + 'static>) -> Self {
        Self {
            id,
            kind: JoinErrorKind::Panic(payload),
            output: None,
        }
    }

    /// Re-types the error, attaching the task's output if it was still
    /// captured.
    pub(crate) fn with_output<U>(self, output: Option<U>) -> JoinError<U> {
        JoinError {
            id: self.id,
            kind: self.kind,
            output,
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        matches!(self.kind, JoinErrorKind::Cancelled { completed: true })
    }

    /// Returns the [`Id`] of the task that failed.
    pub fn task_id(&self) -> Id {
        self.id
    }

    /// Returns `true` if this error was caused by the task being cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, JoinErrorKind::Cancelled { .. })
    }

    /// Returns `true` if this error was caused by the task panicking.
    pub fn is_panic(&self) -> bool {
        matches!(self.kind, JoinErrorKind::Panic(_))
    }

    /// Consumes the error, returning the task's output if the task completed
    /// before the cancellation was observed.
    pub fn into_output(self) -> Option<T> {
        self.output
    }

    /// Consumes the error, returning the panic payload if the task panicked.
    ///
    /// # Panics
    ///
    /// Panics if the error was not caused by a panic; check
    /// [`is_panic`](Self::is_panic) first or use
    /// [`try_into_panic`](Self::try_into_panic).
    #[track_caller]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self.try_into_panic() {
            Ok(payload) => payload,
            Err(_) => panic!("`JoinError` was not caused by a panic"),
        }
    }

    /// Consumes the error, returning the panic payload if the task panicked,
    /// or the error itself otherwise.
    pub fn try_into_panic(self) -> Result<Box<dyn Any + Send + 'static>, Self> {
        match self.kind {
            JoinErrorKind::Panic(payload) => Ok(payload),
            kind => Err(Self {
                id: self.id,
                kind,
                output: self.output,
            }),
        }
    }
}

impl<T> fmt::Display for JoinError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            JoinErrorKind::Cancelled { .. } => write!(f, "task {} was cancelled", self.id),
            JoinErrorKind::Panic(_) => write!(f, "task {} panicked", self.id),
        }
    }
}

impl<T> fmt::Debug for JoinError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            JoinErrorKind::Cancelled { completed } => f
                .debug_struct("JoinError::Cancelled")
                .field("id", &self.id)
                .field("completed", completed)
                .finish(),
            JoinErrorKind::Panic(_) => f
                .debug_struct("JoinError::Panic")
                .field("id", &self.id)
                .finish_non_exhaustive(),
        }
    }
}

impl<T> core::error::Error for JoinError<T> {}
