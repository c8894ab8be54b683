// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{self, AtomicUsize, Ordering};
use crate::task::PollResult;
use crate::util::{loom_const_fn, Backoff};
use core::fmt;

/// Task state. The task stores its state in an atomic `usize` with various
/// bitfields for the necessary information:
///
/// ```text
/// | 63     8 | 7          7 | 6        5 | 4               4 | 3       3 | 2     2 | 1        1 | 0       0 |
/// | refcount | has output   | join waker | has join handle   | cancelled | woken   | complete   | polling   |
/// ```
///
/// The reference count shares the word so that waker clones and drops are a
/// single atomic RMW on the same cell as the lifecycle bits.
pub(crate) struct State {
    val: AtomicUsize,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<usize> {
        /// If set, this task is currently being polled.
        pub(crate) const POLLING: bool;
        /// If set, this task's future has completed (it returned
        /// `Poll::Ready`).
        pub(crate) const COMPLETE: bool;
        /// If set, this task's `Waker` has been woken.
        pub(crate) const WOKEN: bool;
        /// If set, this task has been canceled.
        pub(crate) const CANCELLED: bool;
        /// If set, a `JoinHandle` for this task exists.
        ///
        /// This does *not* indicate the presence of a waker in the join-waker
        /// slot, only that the handle itself is alive; the flag is unset when
        /// the handle is dropped.
        pub(crate) const HAS_JOIN_HANDLE: bool;
        /// The state of the `JoinHandle`'s `Waker` slot.
        const JOIN_WAKER: JoinWakerState;
        /// If set, this task has output ready to be taken by a `JoinHandle`.
        const HAS_OUTPUT: bool;
        /// The number of currently live references to this task.
        ///
        /// When this is 0, the task may be deallocated.
        const REFS = ..;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
enum JoinWakerState {
    /// There is no join waker; the slot is uninitialized.
    Empty = 0b00,
    /// A join waker is *being* registered.
    Registering = 0b01,
    /// A join waker is registered, the slot is initialized.
    Waiting = 0b10,
}

#[must_use]
pub(super) enum StartPollAction {
    /// Successful transition, it's okay to poll the task.
    Poll,
    /// Transition failed, the task must not be polled right now (it is
    /// already complete, or being polled elsewhere).
    DontPoll,
    /// Transition failed because the task was cancelled.
    Cancelled {
        /// If `true`, the task's join waker must be woken.
        wake_join_waker: bool,
    },
}

#[must_use]
pub(super) enum JoinAction {
    /// It's safe to take the task's output.
    TakeOutput,

    /// The task was canceled, it cannot be joined.
    Canceled {
        /// If `true`, the task completed successfully before it was
        /// cancelled and the output can still be read.
        completed: bool,
    },

    /// Register the *first* join waker; the slot is not initialized.
    Register,

    /// The output is not ready, but a previous join waker is registered.
    Reregister,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum WakeByRefAction {
    /// The task should be enqueued.
    Enqueue,
    /// The task does not need to be enqueued.
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum WakeByValAction {
    /// The task should be enqueued.
    Enqueue,
    /// The task does not need to be enqueued.
    None,
    /// The task should be deallocated.
    Drop,
}

const REF_ONE: usize = Snapshot::REFS.first_bit();
const REF_MAX: usize = Snapshot::REFS.raw_mask();

impl State {
    loom_const_fn! {
        /// Returns a task's initial state: not yet woken, with a single
        /// reference (the `TaskRef` produced by allocation).
        pub(super) const fn new() -> State {
            State {
                val: AtomicUsize::new(REF_ONE),
            }
        }
    }

    pub(super) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    /// Attempt to transition the task to `POLLING`; the returned action
    /// indicates what to do with the task.
    ///
    /// Every call must be paired with a call to [`Self::end_poll`] once the
    /// actual poll completed.
    pub(super) fn start_poll(&self) -> StartPollAction {
        let mut should_wait_for_join_waker = false;
        let action = self.transition(|s| {
            // cannot start polling a task which is being polled on another
            // thread, or a task which has completed
            if s.get(Snapshot::POLLING) || s.get(Snapshot::COMPLETE) {
                return StartPollAction::DontPoll;
            }

            // if the task has been canceled, don't poll it.
            if s.get(Snapshot::CANCELLED) {
                let wake_join_waker = s.has_join_waker(&mut should_wait_for_join_waker);
                // cancellation is terminal; the scheduler will drop its
                // reference after this and the output can never appear.
                s.set(Snapshot::COMPLETE, true);
                return StartPollAction::Cancelled { wake_join_waker };
            }

            s
                // the task is now being polled.
                .set(Snapshot::POLLING, true)
                // if the task was woken, consume the wakeup.
                .set(Snapshot::WOKEN, false);

            StartPollAction::Poll
        });

        if should_wait_for_join_waker {
            debug_assert!(matches!(action, StartPollAction::Cancelled { .. }));
            self.wait_for_join_waker();
        }

        action
    }

    /// Transition the task from `POLLING` back to idle; the returned
    /// [`PollResult`] indicates what to do with the task. `completed` must be
    /// set when the polled future returned `Poll::Ready`.
    pub(super) fn end_poll(&self, completed: bool) -> PollResult {
        let mut should_wait_for_join_waker = false;
        let action = self.transition(|s| {
            debug_assert!(s.get(Snapshot::POLLING));
            debug_assert!(!s.get(Snapshot::COMPLETE));
            debug_assert!(
                s.ref_count() > 0,
                "cannot poll a task that has zero references, what is happening!"
            );

            s.set(Snapshot::POLLING, false)
                .set(Snapshot::COMPLETE, completed);

            // Was the task woken during the poll?
            if !completed && s.get(Snapshot::WOKEN) {
                return PollResult::PendingSchedule;
            }

            let had_join_waker = if completed {
                // set the output flag so that the JoinHandle knows it is now
                // safe to read the task's output.
                s.set(Snapshot::HAS_OUTPUT, true);
                s.has_join_waker(&mut should_wait_for_join_waker)
            } else {
                false
            };

            if had_join_waker {
                PollResult::ReadyJoined
            } else if completed {
                PollResult::Ready
            } else {
                PollResult::Pending
            }
        });

        if should_wait_for_join_waker {
            debug_assert_eq!(action, PollResult::ReadyJoined);
            self.wait_for_join_waker();
        }

        action
    }

    pub(super) fn try_join(&self) -> JoinAction {
        fn should_register(s: &mut Snapshot) -> JoinAction {
            let action = match s.get(Snapshot::JOIN_WAKER) {
                JoinWakerState::Empty => JoinAction::Register,
                x => {
                    debug_assert_eq!(x, JoinWakerState::Waiting);
                    JoinAction::Reregister
                }
            };
            s.set(Snapshot::JOIN_WAKER, JoinWakerState::Registering);

            action
        }

        self.transition(|s| {
            let has_output = s.get(Snapshot::HAS_OUTPUT);

            if s.get(Snapshot::CANCELLED) {
                if has_output {
                    s.set(Snapshot::HAS_OUTPUT, false);
                }
                return JoinAction::Canceled {
                    completed: has_output,
                };
            }

            // If the task has not completed, we can't take its join output.
            if !s.get(Snapshot::COMPLETE) {
                return should_register(s);
            }

            // If the task does not have output, we cannot take it.
            if !has_output {
                return should_register(s);
            }

            s.set(Snapshot::HAS_OUTPUT, false);
            JoinAction::TakeOutput
        })
    }

    pub(super) fn join_waker_registered(&self) {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::JOIN_WAKER), JoinWakerState::Registering);
            s.set(Snapshot::JOIN_WAKER, JoinWakerState::Waiting);
        });
    }

    pub(super) fn wake_by_val(&self) -> WakeByValAction {
        self.transition(|s| {
            // If the task was woken *during* a poll, it will be re-queued by
            // the scheduler at the end of the poll if needed, so don't
            // enqueue it now.
            if s.get(Snapshot::POLLING) {
                *s = s.with_woken().drop_ref();
                debug_assert!(s.ref_count() > 0);

                return WakeByValAction::None;
            }

            // If the task is already completed or woken, we don't need to
            // requeue it, but drop the reference the waker held.
            if s.get(Snapshot::COMPLETE) || s.get(Snapshot::WOKEN) {
                let new_state = s.drop_ref();
                *s = new_state;
                return if new_state.ref_count() == 0 {
                    WakeByValAction::Drop
                } else {
                    WakeByValAction::None
                };
            }

            // Otherwise, transition to the woken state and enqueue the task.
            // The reference count is *not* decremented: the waker's reference
            // is handed over to the run queue.
            *s = s.with_woken();
            WakeByValAction::Enqueue
        })
    }

    pub(super) fn wake_by_ref(&self) -> WakeByRefAction {
        self.transition(|state| {
            if state.get(Snapshot::COMPLETE) || state.get(Snapshot::WOKEN) {
                return WakeByRefAction::None;
            }

            if state.get(Snapshot::POLLING) {
                state.set(Snapshot::WOKEN, true);
                return WakeByRefAction::None;
            }

            // Transition to the woken state and enqueue the task, taking a
            // new reference for the run queue.
            *state = state.with_woken().clone_ref();
            WakeByRefAction::Enqueue
        })
    }

    pub(super) fn clone_ref(&self) {
        // A relaxed ordering is fine here; knowledge of the original
        // reference prevents other threads from erroneously deleting the
        // task, and new references can only be formed from existing ones.
        let old_refs = self.val.fetch_add(REF_ONE, Ordering::Relaxed);

        // Guard against overflowing the refcount through `mem::forget`ed
        // wakers. Such a program is degenerate, tearing it down is fine.
        assert!(
            Snapshot::REFS.unpack(old_refs) < Snapshot::REFS.unpack(REF_MAX),
            "task reference count overflow"
        );
    }

    /// Drops one reference, returning `true` if it was the last one and the
    /// task should be deallocated.
    pub(super) fn drop_ref(&self) -> bool {
        // We do not need to synchronize with other threads unless we are
        // going to delete the task.
        let old_refs = self.val.fetch_sub(REF_ONE, Ordering::Release);
        let old_refs = Snapshot::REFS.unpack(old_refs);

        // Did we drop the last ref?
        if old_refs > 1 {
            return false;
        }

        atomic::fence(Ordering::Acquire);
        true
    }

    /// Cancel the task.
    ///
    /// Returns `true` if the task was newly canceled (and should be woken so
    /// the scheduler can observe the cancellation).
    pub(super) fn cancel(&self) -> bool {
        self.transition(|s| {
            // a task that already completed, or was already canceled, has
            // nothing left to cancel
            if s.get(Snapshot::CANCELLED) || s.get(Snapshot::COMPLETE) {
                return false;
            }

            s.set(Snapshot::CANCELLED, true);

            true
        })
    }

    pub(super) fn create_join_handle(&self) {
        self.transition(|s| {
            debug_assert!(
                !s.get(Snapshot::HAS_JOIN_HANDLE),
                "task already has a join handle, cannot create a new one! state={s:?}"
            );

            s.set(Snapshot::HAS_JOIN_HANDLE, true);
        });
    }

    pub(super) fn drop_join_handle(&self) {
        const MASK: usize = !Snapshot::HAS_JOIN_HANDLE.raw_mask();
        let _prev = self.val.fetch_and(MASK, Ordering::Release);
        debug_assert!(
            Snapshot(_prev).get(Snapshot::HAS_JOIN_HANDLE),
            "tried to drop a join handle when the task did not have one!\nstate: {:?}",
            Snapshot(_prev),
        );
    }

    /// Wait out a concurrent [`JoinAction::Register`] on another thread, then
    /// take the join-waker slot back to `Empty` so the completing side has
    /// exclusive read access to it.
    ///
    /// Registration is a short lock-free window (write the waker, one CAS),
    /// so spinning here is bounded.
    fn wait_for_join_waker(&self) {
        let mut backoff = Backoff::new();
        while self.load(Ordering::Acquire).get(Snapshot::JOIN_WAKER) != JoinWakerState::Waiting {
            backoff.spin();
        }
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::JOIN_WAKER), JoinWakerState::Waiting);
            s.set(Snapshot::JOIN_WAKER, JoinWakerState::Empty);
        });
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

impl Snapshot {
    pub(crate) fn ref_count(self) -> usize {
        Snapshot::REFS.unpack(self.0)
    }

    fn drop_ref(self) -> Self {
        Self(self.0 - REF_ONE)
    }

    fn clone_ref(self) -> Self {
        Self(self.0 + REF_ONE)
    }

    fn with_woken(mut self) -> Self {
        self.set(Snapshot::WOKEN, true);
        self
    }

    /// Checks whether a join waker needs to be woken, consuming the waker
    /// slot if it is fully registered.
    ///
    /// If the slot is mid-registration on another thread, `should_wait` is
    /// set and the caller must call [`State::wait_for_join_waker`] after its
    /// transition committed.
    fn has_join_waker(&mut self, should_wait: &mut bool) -> bool {
        match self.get(Snapshot::JOIN_WAKER) {
            JoinWakerState::Empty => false,
            JoinWakerState::Registering => {
                debug_assert!(
                    self.get(Snapshot::HAS_JOIN_HANDLE),
                    "a task cannot register a join waker if it does not have a join handle!",
                );
                *should_wait = true;
                true
            }
            JoinWakerState::Waiting => {
                debug_assert!(
                    self.get(Snapshot::HAS_JOIN_HANDLE),
                    "a task cannot have a join waker if it does not have a join handle!",
                );
                *should_wait = false;
                self.set(Snapshot::JOIN_WAKER, JoinWakerState::Empty);
                true
            }
        }
    }
}

impl mycelium_bitfield::FromBits<usize> for JoinWakerState {
    type Error = core::convert::Infallible;

    const BITS: u32 = 2;

    #[inline]
    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Registering as usize => Ok(Self::Registering),
            b if b == Self::Waiting as usize => Ok(Self::Waiting),
            b if b == Self::Empty as usize => Ok(Self::Empty),
            _ => {
                // this can only happen if the bitpacking code is broken
                unreachable!("invalid join waker state {bits:#b}")
            }
        }
    }

    #[inline]
    fn into_bits(self) -> usize {
        self as u8 as usize
    }
}
