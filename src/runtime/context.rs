// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-local runtime context.
//!
//! Two pieces of state are tracked per thread:
//!
//! - the *current handle*, installed on worker threads and inside
//!   `block_on`, which is what [`Handle::try_current`] and the free-standing
//!   `spawn`/`sleep` functions resolve to, and
//! - the *current worker*, a pointer to the worker's [`Core`] that lets
//!   wakers running on a worker thread use the LIFO slot and local queue
//!   instead of the global injector.
//!
//! [`Handle::try_current`]: crate::runtime::Handle::try_current

use crate::runtime::{Handle, Shared};
use crate::scheduler::Core;
use crate::task::Id;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use std::sync::Arc;

thread_local! {
    static CURRENT_HANDLE: RefCell<Option<Handle>> = RefCell::new(None);
    static CURRENT_WORKER: Cell<Option<WorkerContext>> = Cell::new(None);
    static CURRENT_TASK: Cell<Option<Id>> = Cell::new(None);
}

/// The identity of the worker running on this thread.
#[derive(Clone, Copy)]
pub(crate) struct WorkerContext {
    core: NonNull<Core>,
    /// Address of the owning runtime's shared state, for identity checks;
    /// never dereferenced.
    shared_id: usize,
    index: usize,
}

impl WorkerContext {
    /// Whether this worker belongs to the runtime owning `shared`.
    pub(crate) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        self.shared_id == Arc::as_ptr(shared) as usize
    }

    pub(crate) fn core(&self) -> &Core {
        // Safety: the context is only ever visible on the thread that owns
        // the core, and `WorkerGuard` removes it before the core is dropped.
        unsafe { self.core.as_ref() }
    }
}

/// Installs `handle` as this thread's current runtime handle, restoring the
/// previous one (if any) on drop.
pub(crate) fn enter(handle: Handle) -> EnterGuard {
    let prev = CURRENT_HANDLE.with(|current| current.borrow_mut().replace(handle));
    EnterGuard { prev }
}

pub(crate) struct EnterGuard {
    prev: Option<Handle>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_HANDLE.with(|current| *current.borrow_mut() = prev);
    }
}

pub(crate) fn try_current() -> Option<Handle> {
    CURRENT_HANDLE.with(|current| current.borrow().clone())
}

/// Publishes the worker's core to this thread.
///
/// # Safety
///
/// The returned guard must be dropped before `core` is; the caller keeps the
/// core alive and on this thread for the guard's whole lifetime.
pub(crate) unsafe fn enter_worker(core: &Core, shared: &Arc<Shared>) -> WorkerGuard {
    CURRENT_WORKER.with(|current| {
        debug_assert!(current.get().is_none(), "nested worker contexts");
        current.set(Some(WorkerContext {
            core: NonNull::from(core),
            shared_id: Arc::as_ptr(shared) as usize,
            index: core.index(),
        }));
    });
    WorkerGuard { _priv: () }
}

pub(crate) struct WorkerGuard {
    _priv: (),
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|current| current.set(None));
    }
}

pub(crate) fn with_worker<R>(f: impl FnOnce(Option<&WorkerContext>) -> R) -> R {
    CURRENT_WORKER.with(|current| {
        let ctx = current.get();
        f(ctx.as_ref())
    })
}

/// The index of the worker running on the calling thread, if any.
pub(crate) fn current_worker_id() -> Option<usize> {
    CURRENT_WORKER.with(|current| current.get().map(|worker| worker.index))
}

pub(crate) fn set_current_task(id: Option<Id>) {
    CURRENT_TASK.with(|current| current.set(id));
}

/// The [`Id`] of the task currently being polled on this thread, if any.
pub(crate) fn current_task() -> Option<Id> {
    CURRENT_TASK.with(|current| current.get())
}
