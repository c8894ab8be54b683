// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task layer: a spawned [`Future`] plus the scheduler bookkeeping that
//! drives it.
//!
//! A spawned future is allocated once, together with its state word, vtable,
//! run-queue links and join-waker slot, and from then on is only ever touched
//! through [`TaskRef`]s, type-erased reference-counted pointers into that
//! allocation. The task's [`Waker`] is a `TaskRef` in a trenchcoat: waking
//! transitions the state word and hands the reference to a run queue.

mod builder;
mod id;
mod join_handle;
mod state;
mod yield_now;

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::Ordering;
use crate::scheduler::Schedule;
use crate::task::state::{
    JoinAction, Snapshot, StartPollAction, State, WakeByRefAction, WakeByValAction,
};
use crate::util::CachePadded;
use core::any::type_name;
use core::fmt;
use core::future::Future;
use core::mem::{self, offset_of, MaybeUninit};
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use cordyceps::mpsc_queue;
use cordyceps::Linked;

pub(crate) use builder::TaskBuilder;
pub use id::Id;
pub use join_handle::{JoinError, JoinHandle};
pub use yield_now::yield_now;

/// Outcome of calling [`TaskRef::poll`].
///
/// This type describes how to proceed with a given task, whether it needs to
/// be rescheduled or can be dropped etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task has completed, without waking a [`JoinHandle`] waker.
    ///
    /// The scheduler can drop the [`TaskRef`].
    Ready,

    /// The task has completed and a [`JoinHandle`] waker has been woken.
    ///
    /// The scheduler can drop the [`TaskRef`].
    ReadyJoined,

    /// The task is pending, but not woken.
    ///
    /// The scheduler can drop the [`TaskRef`], as whoever intends to wake the
    /// task later is holding a clone of its [`Waker`].
    Pending,

    /// The task has woken itself during the poll (or was forced to yield by
    /// the cooperative budget).
    ///
    /// The scheduler should re-schedule the task, rather than dropping the
    /// [`TaskRef`].
    PendingSchedule,
}

/// A type-erased, reference-counted pointer to a spawned task.
///
/// Once spawned, a task is pinned in memory (a requirement of [`Future`]).
/// Instead of moving tasks around, the scheduler moves `TaskRef`s, which are
/// just pointers to the pinned allocation, and interacts with it through the
/// task's vtable. This keeps the scheduler itself non-generic: spawning ten
/// differently-typed `async {}` blocks does not stamp out ten copies of the
/// run-queue machinery.
///
/// `TaskRef`s are reference-counted, and the task is deallocated when the
/// last `TaskRef` pointing to it is dropped.
#[derive(Eq, PartialEq)]
pub(crate) struct TaskRef(NonNull<Header>);

#[repr(C)]
pub(crate) struct Task<F: Future, S: Schedule>(CachePadded<TaskInner<F, S>>);

#[repr(C)]
struct TaskInner<F: Future, S: Schedule> {
    /// This must be the first field of the `TaskInner` struct!
    schedulable: Schedulable<S>,

    /// The future that the task is running, or its output once it completed.
    ///
    /// If `COMPLETE` is one, the `JoinHandle` has exclusive access to this
    /// field. If `COMPLETE` is zero, the `POLLING` bit functions as a lock
    /// for this field, and it may only be accessed by the thread that set
    /// `POLLING` to one.
    stage: UnsafeCell<Stage<F>>,

    /// Waker of the task waiting on this task's completion.
    ///
    /// Access is mediated by the `JOIN_WAKER` bits in the state word: the
    /// `JoinHandle` may write the field only after winning the transition to
    /// `Registering`, and the completing thread may read it only after the
    /// slot reached `Waiting` and it took the slot back to `Empty`.
    join_waker: UnsafeCell<Option<Waker>>,
}

#[repr(C)]
struct Schedulable<S: Schedule> {
    /// This must be the first field of the `Schedulable` struct!
    header: Header,
    /// The scheduler handle woken tasks are handed back to.
    scheduler: S,
}

/// The current lifecycle stage of the future: either the future itself, or
/// its output.
#[repr(C)] // https://github.com/rust-lang/miri/issues/3780
enum Stage<F: Future> {
    /// The future is still pending.
    Pending(F),

    /// The future has completed, and its output is ready to be taken by a
    /// `JoinHandle`, if one exists.
    Ready(Result<F::Output, JoinError<F::Output>>),

    /// The future has completed, and the task's output has been taken or is
    /// not needed.
    Consumed,
}

pub(crate) struct Header {
    /// The task's state.
    ///
    /// This field is accessed with atomic instructions, so it's always safe
    /// to touch.
    state: State,
    /// The task vtable for this task.
    vtable: &'static VTable,
    /// The task's ID.
    id: Id,
    /// Intrusive links used while the task sits in the global injection
    /// queue.
    run_queue_links: mpsc_queue::Links<Header>,
    /// The tracing span associated with this task, for debugging purposes.
    span: tracing::Span,
}

struct VTable {
    /// Poll the future, returning a [`PollResult`] that indicates what the
    /// scheduler should do with the polled task.
    poll: unsafe fn(NonNull<Header>) -> PollResult,

    /// Poll the task's `JoinHandle` for completion, storing the output at the
    /// provided [`NonNull`] pointer if the task has completed.
    ///
    /// If the task has not completed, the [`Waker`] from the provided
    /// [`Context`] is registered to be woken when the task completes.
    poll_join: unsafe fn(
        ptr: NonNull<Header>,
        outptr: NonNull<()>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), JoinError<()>>>,

    /// Drops the task and deallocates its memory.
    deallocate: unsafe fn(NonNull<Header>),

    /// The `wake_by_ref` function from the task's [`RawWakerVTable`].
    ///
    /// This is duplicated here as it's used to wake canceled tasks when a
    /// task is canceled by a [`TaskRef`] or [`JoinHandle`].
    wake_by_ref: unsafe fn(*const ()),
}

// === impl TaskRef ===

impl TaskRef {
    #[track_caller]
    pub(crate) fn new_allocated<F, S>(task: Box<Task<F, S>>) -> (Self, JoinHandle<F::Output>)
    where
        F: Future,
        S: Schedule,
    {
        // Safety: `Box::leak` never returns a null pointer
        let task = Self(NonNull::from(Box::leak(task)).cast::<Header>());
        debug_assert_eq!(task.state().load(Ordering::Acquire).ref_count(), 1);
        let join = JoinHandle::new(task.clone());

        (task, join)
    }

    /// Allocates the stub task used as the initial element of the intrusive
    /// injection queue.
    pub(crate) fn new_stub() -> Self {
        let task = Box::new(Task::<Stub, Stub>::new_stub());
        Self(NonNull::from(Box::leak(task)).cast::<Header>())
    }

    /// Returns the task's unique[^1] identifier.
    ///
    /// [^1]: Unique to all *currently running* tasks, *not* unique across
    ///     spacetime. See [`Id`] for details.
    pub(crate) fn id(&self) -> Id {
        self.header().id
    }

    /// Returns `true` when this task has run to completion.
    pub(crate) fn is_complete(&self) -> bool {
        self.state().load(Ordering::Acquire).get(Snapshot::COMPLETE)
    }

    /// Cancels the task.
    ///
    /// Returns `true` if the task was newly cancelled by this call.
    pub(crate) fn cancel(&self) -> bool {
        // try to set the cancelled bit.
        let canceled = self.state().cancel();

        // if the task was successfully canceled, wake it so that the
        // scheduler visits it once more and can clean up after it.
        if canceled {
            tracing::trace!(task = ?self, "woke canceled task");
            self.wake_by_ref();
        }

        canceled
    }

    /// Tears the task down during runtime shutdown: cancels it and performs
    /// the final poll that completes the cancellation (waking any registered
    /// join waker), without ever re-enqueueing it.
    pub(crate) fn shutdown(self) {
        self.state().cancel();
        let _ = self.poll();
        // dropping `self` releases the reference the run queue held
    }

    pub(crate) fn header_ptr(&self) -> NonNull<Header> {
        self.0
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: the constructors ensure the pointer is always valid
        unsafe { self.0.as_ref() }
    }

    /// Returns a reference to the task's state.
    pub(crate) fn state(&self) -> &State {
        &self.header().state
    }

    pub(crate) fn wake_by_ref(&self) {
        let wake_by_ref_fn = self.header().vtable.wake_by_ref;
        // Safety: called through our own vtable with our own data pointer
        unsafe { wake_by_ref_fn(self.0.as_ptr().cast::<()>()) }
    }

    pub(crate) fn poll(&self) -> PollResult {
        let poll_fn = self.header().vtable.poll;
        // Safety: called through our own vtable with our own data pointer
        unsafe { poll_fn(self.0) }
    }

    /// # Safety
    ///
    /// The caller needs to make sure that `T` is the output type this
    /// `TaskRef` was created with.
    pub(crate) unsafe fn poll_join<T>(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<T, JoinError<T>>> {
        let poll_join_fn = self.header().vtable.poll_join;
        let mut slot = MaybeUninit::<Result<T, JoinError<T>>>::uninit();

        // Safety: called through the vtable; as long as the caller makes sure
        // `T` is the right type this call is safe
        let result = unsafe { poll_join_fn(self.0, NonNull::from(&mut slot).cast::<()>(), cx) };

        result.map(|result| match result {
            // the task completed normally and the output (which may itself
            // record a panic) was written into the slot
            // Safety: the `Ok` return promises the slot was initialized
            Ok(()) => unsafe { slot.assume_init_read() },
            Err(e) => {
                let output = if e.is_completed() {
                    // the task completed before it was cancelled, its output
                    // was still written into the slot and can be returned
                    // alongside the error.
                    // Safety: `is_completed` promises the slot was initialized
                    match unsafe { slot.assume_init_read() } {
                        Ok(output) => Some(output),
                        Err(e) => return Err(e),
                    }
                } else {
                    None
                };
                Err(e.with_output(output))
            }
        })
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("addr", &self.0)
            .finish()
    }
}

impl fmt::Pointer for TaskRef {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}

impl Clone for TaskRef {
    #[inline]
    #[track_caller]
    fn clone(&self) -> Self {
        self.state().clone_ref();
        Self(self.0)
    }
}

impl Drop for TaskRef {
    #[inline]
    #[track_caller]
    fn drop(&mut self) {
        if !self.state().drop_ref() {
            return;
        }

        let deallocate = self.header().vtable.deallocate;
        // Safety: we hold the last reference, nothing can touch the task
        // after this
        unsafe {
            deallocate(self.0);
        }
    }
}

// Safety: the state protocol ensures synchronized access to the inner task
unsafe impl Send for TaskRef {}
// Safety: the state protocol ensures synchronized access to the inner task
unsafe impl Sync for TaskRef {}

// === impl Task ===

impl<F, S> Task<F, S>
where
    F: Future,
    S: Schedule,
{
    const TASK_VTABLE: VTable = VTable {
        poll: Self::poll,
        poll_join: Self::poll_join,
        deallocate: Self::deallocate,
        wake_by_ref: Schedulable::<S>::wake_by_ref,
    };

    pub(crate) fn new(future: F, task_id: Id, scheduler: S, span: tracing::Span) -> Self {
        let inner = TaskInner {
            schedulable: Schedulable {
                header: Header {
                    state: State::new(),
                    vtable: &Self::TASK_VTABLE,
                    id: task_id,
                    run_queue_links: mpsc_queue::Links::new(),
                    span,
                },
                scheduler,
            },
            stage: UnsafeCell::new(Stage::Pending(future)),
            join_waker: UnsafeCell::new(None),
        };
        Self(CachePadded(inner))
    }

    /// Poll the future, returning a [`PollResult`] that indicates what the
    /// scheduler should do with the polled task.
    ///
    /// This is a type-erased function called through the task's vtable.
    ///
    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a task of type `Self` (i.e. the
    /// pointed header must have the same `F` and `S` type parameters as
    /// `Self`).
    unsafe fn poll(ptr: NonNull<Header>) -> PollResult {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>().as_ref();

            tracing::trace!(
                task_addr = ?ptr,
                task.output = type_name::<F::Output>(),
                task_tid = this.id().as_u64(),
                "Task::poll",
            );

            match this.state().start_poll() {
                // Successfully transitioned to `POLLING`, all is good!
                StartPollAction::Poll => {}
                // Something isn't right, we shouldn't poll the task right now
                StartPollAction::DontPoll => {
                    tracing::warn!(task_addr = ?ptr, "failed to transition to polling");
                    return PollResult::Ready;
                }
                StartPollAction::Cancelled { wake_join_waker } => {
                    tracing::trace!(task_addr = ?ptr, "task cancelled");
                    // drop the future right away: it may hold resources (and
                    // waker clones that point back at this very task, which
                    // would otherwise keep it alive forever)
                    this.drop_stage();
                    if wake_join_waker {
                        this.wake_join_waker();
                        return PollResult::ReadyJoined;
                    }
                    return PollResult::Ready;
                }
            }

            // wrap the waker in `ManuallyDrop` because we're converting it
            // from an existing task ref, rather than incrementing the task
            // ref count. if this waker is consumed during the poll, we don't
            // want to decrement its ref count when the poll ends.
            let waker = {
                let raw = Schedulable::<S>::raw_waker(ptr.as_ptr().cast());
                mem::ManuallyDrop::new(Waker::from_raw(raw))
            };

            // actually poll the task
            let poll = {
                let cx = Context::from_waker(&waker);
                this.poll_inner(cx)
            };

            let result = this.state().end_poll(poll.is_ready());

            // if the task is ready and has a `JoinHandle` to wake, wake the
            // join waker now.
            if result == PollResult::ReadyJoined {
                this.wake_join_waker();
            }

            result
        }
    }

    /// Poll to join the task pointed to by `ptr`, taking its output if it has
    /// completed.
    ///
    /// If the task has completed, this method returns [`Poll::Ready`], and
    /// the task's output is stored at the memory location pointed to by
    /// `outptr`. This function is called by [`JoinHandle`]s to poll the task
    /// they correspond to.
    ///
    /// This is a type-erased function called through the task's vtable.
    ///
    /// # Safety
    ///
    /// - `ptr` must point to the [`Header`] of a task of type `Self`.
    /// - `outptr` must point to a valid `MaybeUninit<Result<F::Output,
    ///   JoinError<F::Output>>>`.
    unsafe fn poll_join(
        ptr: NonNull<Header>,
        outptr: NonNull<()>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), JoinError<()>>> {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            tracing::trace!(
                task_addr = ?ptr,
                task.output = type_name::<F::Output>(),
                task_tid = this.id().as_u64(),
                "Task::poll_join",
            );

            match this.state().try_join() {
                JoinAction::TakeOutput => {
                    // Safety: the state transition grants us exclusive
                    // permission to read the task output.
                    this.take_output(outptr);
                    return Poll::Ready(Ok(()));
                }
                JoinAction::Canceled { completed } => {
                    // if the task completed before it was canceled, also read
                    // the output, so it can be returned in the `JoinError`.
                    if completed {
                        // Safety: the state transition grants us exclusive
                        // permission to take the output.
                        this.take_output(outptr);
                    }
                    return Poll::Ready(Err(JoinError::cancelled(completed, this.id())));
                }
                JoinAction::Register => {
                    this.0 .0.join_waker.with_mut(|waker| {
                        (*waker) = Some(cx.waker().clone());
                    });
                }
                JoinAction::Reregister => {
                    this.0 .0.join_waker.with_mut(|waker| {
                        let waker = (*waker).as_mut().unwrap();

                        let new_waker = cx.waker();
                        if !waker.will_wake(new_waker) {
                            *waker = new_waker.clone();
                        }
                    });
                }
            }
            this.state().join_waker_registered();
            Poll::Pending
        }
    }

    /// Drops the task and deallocates its memory.
    ///
    /// This is a type-erased function called through the task's vtable.
    ///
    /// # Safety
    ///
    /// - `ptr` must point to the [`Header`] of a task of type `Self`.
    /// - the task's reference count must be zero.
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>();
            tracing::trace!(
                task_addr = ?ptr,
                task_tid = this.as_ref().id().as_u64(),
                "Task::deallocate",
            );
            debug_assert_eq!(
                ptr.as_ref().state.load(Ordering::Acquire).ref_count(),
                0,
                "a task may not be deallocated if its ref count is greater than zero!"
            );
            drop(Box::from_raw(this.as_ptr()));
        }
    }

    /// Polls the future. If the future completes, the output is written to
    /// the stage field.
    ///
    /// # Safety
    ///
    /// The caller has to ensure this thread has exclusive mutable access to
    /// the task's `stage` field (i.e. the `POLLING` bit is set).
    unsafe fn poll_inner(&self, mut cx: Context<'_>) -> Poll<()> {
        let _span = self.span().enter();

        self.0 .0.stage.with_mut(|stage| {
            // Safety: ensured by caller
            let stage = unsafe { &mut *stage };
            stage.poll(&mut cx, self.id())
        })
    }

    /// Wakes the task's [`JoinHandle`], if it has one.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the task's join waker. This
    /// is ensured by the task's state management.
    unsafe fn wake_join_waker(&self) {
        // Safety: ensured by caller
        unsafe {
            self.0 .0.join_waker.with_mut(|waker| {
                if let Some(join_waker) = (*waker).take() {
                    tracing::trace!("waking {join_waker:?}");
                    join_waker.wake();
                } else {
                    tracing::trace!("called wake_join_waker on non-existing waker");
                }
            });
        }
    }

    /// Drops whatever the stage holds (the future, or an unclaimed output).
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the task's stage; this is
    /// granted to whoever wins the cancellation transition.
    unsafe fn drop_stage(&self) {
        // Safety: ensured by caller
        unsafe {
            self.0 .0.stage.with_mut(|stage| {
                *stage = Stage::Consumed;
            });
        }
    }

    /// # Safety
    ///
    /// - the caller must have exclusive access to the task's stage (granted
    ///   by the `TakeOutput`/`Canceled { completed: true }` transitions)
    /// - `dst` must point to a valid `MaybeUninit<Result<F::Output,
    ///   JoinError<F::Output>>>`.
    unsafe fn take_output(&self, dst: NonNull<()>) {
        // Safety: ensured by caller
        unsafe {
            self.0 .0.stage.with_mut(|stage| {
                match mem::replace(&mut *stage, Stage::Consumed) {
                    Stage::Ready(output) => {
                        // Safety: the caller is responsible for ensuring that
                        // this points to a `MaybeUninit` of the right type.
                        let dst = dst
                            .cast::<MaybeUninit<Result<F::Output, JoinError<F::Output>>>>()
                            .as_mut();

                        dst.write(output);
                    }
                    _ => panic!("JoinHandle polled after completion"),
                }
            });
        }
    }

    fn id(&self) -> Id {
        self.0 .0.schedulable.header.id
    }
    fn state(&self) -> &State {
        &self.0 .0.schedulable.header.state
    }
    #[inline]
    fn span(&self) -> &tracing::Span {
        &self.0 .0.schedulable.header.span
    }
}

impl Task<Stub, Stub> {
    const STUB_VTABLE: VTable = VTable {
        poll: stub_poll,
        poll_join: stub_poll_join,
        // the stub task is heap allocated, so it *will* need to be
        // deallocated when the queue holding it is dropped.
        deallocate: Self::deallocate,
        wake_by_ref: stub_wake_by_ref,
    };

    /// Create a new stub task.
    pub(crate) fn new_stub() -> Self {
        let inner = TaskInner {
            schedulable: Schedulable {
                header: Header {
                    state: State::new(),
                    vtable: &Self::STUB_VTABLE,
                    id: Id::stub(),
                    run_queue_links: mpsc_queue::Links::new_stub(),
                    span: tracing::Span::none(),
                },
                scheduler: Stub,
            },
            stage: UnsafeCell::new(Stage::Pending(Stub)),
            join_waker: UnsafeCell::new(None),
        };

        Self(CachePadded(inner))
    }
}

// === impl Stage ===

impl<F> Stage<F>
where
    F: Future,
{
    fn poll(&mut self, cx: &mut Context<'_>, id: Id) -> Poll<()> {
        struct Guard<'a, T: Future> {
            stage: &'a mut Stage<T>,
        }
        impl<T: Future> Drop for Guard<'_, T> {
            fn drop(&mut self) {
                // If the future panics on poll, it is dropped inside the
                // panic guard.
                *self.stage = Stage::Consumed;
            }
        }

        let poll = AssertUnwindSafe(|| -> Poll<F::Output> {
            let guard = Guard { stage: self };

            let Stage::Pending(future) = guard.stage else {
                unreachable!("a task's future may only be polled while Pending");
            };

            // Safety: tasks are always pinned on the heap, the future is
            // never moved out of the stage cell.
            let future = unsafe { Pin::new_unchecked(future) };
            let res = future.poll(cx);
            mem::forget(guard);
            res
        });

        match std::panic::catch_unwind(poll) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(ready)) => {
                *self = Stage::Ready(Ok(ready));
                Poll::Ready(())
            }
            Err(err) => {
                tracing::warn!(task_tid = id.as_u64(), "task panicked");
                *self = Stage::Ready(Err(JoinError::panic(id, err)));
                Poll::Ready(())
            }
        }
    }
}

// === impl Schedulable ===

impl<S: Schedule> Schedulable<S> {
    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_waker,
        Self::wake_by_val,
        Self::wake_by_ref,
        Self::drop_waker,
    );

    // `Waker::will_wake` is used all over the place to optimize waker code
    // (e.g. only update wakers if they have a different wake target). Problem
    // is `will_wake` only checks for pointer equality and since
    // `raw_waker` would usually be inlined in release mode (and with it
    // `WAKER_VTABLE`) the waker identity would be different before and after
    // calling `.clone()`. This isn't a correctness problem since it's still
    // the same waker in the end, it just causes a lot of unnecessary wake
    // ups. The `inline(never)` below is therefore quite load-bearing.
    #[inline(never)]
    fn raw_waker(this: *const Self) -> RawWaker {
        RawWaker::new(this.cast::<()>(), &Self::WAKER_VTABLE)
    }

    /// Hand a woken task back to its scheduler.
    ///
    /// # Safety
    ///
    /// `this` must point at a task whose `Schedulable` has type `Self`.
    unsafe fn schedule(this: TaskRef) {
        // Safety: ensured by caller
        unsafe {
            // clone the scheduler handle out of the task first: scheduling
            // hands the task to another thread, which may complete and free
            // it while a borrow into the allocation would still be live.
            let scheduler = this.0.cast::<Self>().as_ref().scheduler.clone();
            scheduler.schedule(this);
        }
    }

    #[inline]
    unsafe fn drop_ref(this: NonNull<Self>) {
        // Safety: ensured by caller
        unsafe {
            if !this.as_ref().header.state.drop_ref() {
                return;
            }

            let deallocate = this.as_ref().header.vtable.deallocate;
            deallocate(this.cast::<Header>());
        }
    }

    // === Waker vtable methods ===

    unsafe fn wake_by_val(ptr: *const ()) {
        // Safety: only ever called through the raw waker vtable
        unsafe {
            let ptr = ptr.cast::<Self>();
            tracing::trace!(
                target: "scheduler::waker",
                task_addr = ?ptr,
                task_tid = (*ptr).header.id.as_u64(),
                "Task::wake_by_val",
            );

            let this = NonNull::new_unchecked(ptr.cast_mut());
            match this.as_ref().header.state.wake_by_val() {
                WakeByValAction::Enqueue => {
                    // the task should be enqueued. the waker's reference is
                    // handed over to the run queue, so the count is neither
                    // incremented nor decremented here.
                    Self::schedule(TaskRef(this.cast::<Header>()));
                }
                WakeByValAction::Drop => {
                    // the state transition already released the waker's
                    // reference and it was the last one
                    let deallocate = this.as_ref().header.vtable.deallocate;
                    deallocate(this.cast::<Header>());
                }
                WakeByValAction::None => {}
            }
        }
    }

    unsafe fn wake_by_ref(ptr: *const ()) {
        // Safety: only ever called through the raw waker vtable (or the task
        // vtable's copy of this function)
        unsafe {
            let this = ptr.cast::<Self>();
            tracing::trace!(
                target: "scheduler::waker",
                task_addr = ?this,
                task_tid = (*this).header.id.as_u64(),
                "Task::wake_by_ref",
            );

            let this = NonNull::new_unchecked(this.cast_mut());
            if this.as_ref().header.state.wake_by_ref() == WakeByRefAction::Enqueue {
                // `wake_by_ref` took a new reference for the run queue.
                Self::schedule(TaskRef(this.cast::<Header>()));
            }
        }
    }

    unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
        // Safety: only ever called through the raw waker vtable
        unsafe {
            let ptr = ptr.cast::<Self>();
            tracing::trace!(
                target: "scheduler::waker",
                task_addr = ?ptr,
                task_tid = (*ptr).header.id.as_u64(),
                "Task::clone_waker",
            );

            (*ptr).header.state.clone_ref();
            Self::raw_waker(ptr)
        }
    }

    unsafe fn drop_waker(ptr: *const ()) {
        // Safety: only ever called through the raw waker vtable
        unsafe {
            let ptr = ptr.cast::<Self>();
            tracing::trace!(
                target: "scheduler::waker",
                task_addr = ?ptr,
                task_tid = (*ptr).header.id.as_u64(),
                "Task::drop_waker",
            );

            Self::drop_ref(NonNull::new_unchecked(ptr.cast_mut()));
        }
    }
}

// === impl Header ===

// Safety: tasks are always treated as pinned in memory (a requirement for
// polling them) and the reference count keeps the underlying memory alive for
// as long as the `TaskRef` is part of the injection queue.
unsafe impl Linked<mpsc_queue::Links<Header>> for Header {
    type Handle = TaskRef;

    fn into_ptr(task: Self::Handle) -> NonNull<Self> {
        let ptr = task.0;
        // converting a `TaskRef` into a pointer to enqueue it assigns
        // ownership of the ref count to the queue, so we don't want to run
        // its `Drop` impl.
        mem::forget(task);
        ptr
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        TaskRef(ptr)
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>>
    where
        Self: Sized,
    {
        let offset = offset_of!(Self, run_queue_links);
        // Safety: adding a field offset to a valid task pointer stays within
        // the allocation
        unsafe { NonNull::new_unchecked(ptr.as_ptr().cast::<u8>().add(offset).cast()) }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A zero-size placeholder plugged into the generics of the heap-allocated
/// stub task that seeds each injection queue. It is never polled and never
/// schedules anything.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Stub;

impl Future for Stub {
    type Output = ();
    fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        unreachable!("the stub task should never be polled!")
    }
}

impl Schedule for Stub {
    fn schedule(&self, _: TaskRef) {
        unreachable!("the stub scheduler should never be called!");
    }
}

unsafe fn stub_poll(ptr: NonNull<Header>) -> PollResult {
    // Safety: this method should never be called
    unsafe {
        debug_assert!(ptr.as_ref().id.is_stub());
        unreachable!("stub task ({ptr:?}) should never be polled!");
    }
}

unsafe fn stub_poll_join(
    ptr: NonNull<Header>,
    _outptr: NonNull<()>,
    _cx: &mut Context<'_>,
) -> Poll<Result<(), JoinError<()>>> {
    // Safety: this method should never be called
    unsafe {
        debug_assert!(ptr.as_ref().id.is_stub());
        unreachable!("stub task ({ptr:?}) should never be polled!");
    }
}

unsafe fn stub_wake_by_ref(ptr: *const ()) {
    unreachable!("stub task ({ptr:p}) has no waker and should never be woken!");
}
