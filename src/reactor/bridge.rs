// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The completion bridge: the per-operation record coupling one in-flight OS
//! operation to one suspended future.
//!
//! A bridge is shared between the submitter (through its `OpHandle`) and the
//! reactor (through the registration slab). All communication goes through
//! one atomic status word and a [`WaitCell`] waker slot: the reactor
//! release-stores a terminal status and fires the waker, the owning future
//! acquire-loads the status on its next poll. Once the status is terminal the
//! reactor never writes again, so the two sides are never live at the same
//! time.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::WaitCell;
use bitflags::bitflags;
use core::fmt;
use mio::Interest;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// What kind of operation a bridge tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OpKind {
    Read,
    Write,
    Accept,
    Connect,
    Close,
    Fsync,
    Timeout,
}

bitflags! {
    /// The readiness reported for a completed operation.
    ///
    /// On a readiness backend this tells the owning future which nonblocking
    /// syscall will now make progress; the future performs it itself, looping
    /// until `EAGAIN`, and re-arms the operation for more.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: usize {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const READ_CLOSED = 1 << 2;
        const WRITE_CLOSED = 1 << 3;
        const ERROR = 1 << 4;
    }
}

impl Readiness {
    pub(crate) fn from_mio(event: &mio::event::Event) -> Self {
        let mut readiness = Readiness::empty();
        if event.is_readable() {
            readiness |= Readiness::READABLE;
        }
        if event.is_writable() {
            readiness |= Readiness::WRITABLE;
        }
        if event.is_read_closed() {
            readiness |= Readiness::READ_CLOSED;
        }
        if event.is_write_closed() {
            readiness |= Readiness::WRITE_CLOSED;
        }
        if event.is_error() {
            readiness |= Readiness::ERROR;
        }
        readiness
    }
}

/// Decoded bridge status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    /// Submitted to the backend, no completion yet.
    Submitted,
    /// The backend reported readiness.
    Ready(Readiness),
    /// The deadline expired before a completion arrived.
    TimedOut,
    /// The operation was cancelled.
    Cancelled,
    /// The backend reported an error (`errno`).
    Failed(i32),
}

// status word layout: low 3 bits discriminant, payload (readiness bits or
// errno) shifted above
const STATE_MASK: usize = 0b111;
const PAYLOAD_SHIFT: u32 = 3;

const SUBMITTED: usize = 0;
const READY: usize = 1;
const TIMED_OUT: usize = 2;
const CANCELLED: usize = 3;
const FAILED: usize = 4;

pub(crate) struct Bridge {
    /// The slab key, doubling as the backend token.
    key: usize,
    kind: OpKind,
    fd: Option<RawFd>,
    interest: Option<Interest>,
    submitted_at: Instant,
    deadline: Option<Instant>,
    /// See the module docs; all stores are `Release`, all loads `Acquire`.
    status: AtomicUsize,
    /// The owning future's waker, set on its first `Pending` poll.
    waker: WaitCell,
}

// === impl Bridge ===

impl Bridge {
    pub(crate) fn new(
        key: usize,
        kind: OpKind,
        fd: Option<RawFd>,
        interest: Option<Interest>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            key,
            kind,
            fd,
            interest,
            submitted_at: Instant::now(),
            deadline,
            status: AtomicUsize::new(SUBMITTED),
            waker: WaitCell::new(),
        }
    }

    pub(crate) fn key(&self) -> usize {
        self.key
    }

    pub(crate) fn kind(&self) -> OpKind {
        self.kind
    }

    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        self.interest
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn waker(&self) -> &WaitCell {
        &self.waker
    }

    pub(crate) fn status(&self) -> Status {
        let word = self.status.load(Ordering::Acquire);
        let payload = word >> PAYLOAD_SHIFT;
        match word & STATE_MASK {
            SUBMITTED => Status::Submitted,
            READY => Status::Ready(Readiness::from_bits_retain(payload)),
            TIMED_OUT => Status::TimedOut,
            CANCELLED => Status::Cancelled,
            FAILED => Status::Failed(payload as i32),
            state => unreachable!("invalid bridge status {state:#b}"),
        }
    }

    /// Record a readiness completion. Returns `false` if the bridge already
    /// reached a terminal status (completion after cancel stays cancelled).
    pub(crate) fn complete_ready(&self, readiness: Readiness) -> bool {
        self.transition(READY | (readiness.bits() << PAYLOAD_SHIFT))
    }

    /// Expire the operation's deadline.
    pub(crate) fn complete_timed_out(&self) -> bool {
        self.transition(TIMED_OUT)
    }

    /// Request cancellation. Returns `true` if the bridge was still in
    /// flight; any completion arriving afterwards is reported as `Cancelled`.
    pub(crate) fn try_cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    /// Record a backend failure.
    pub(crate) fn fail(&self, errno: i32) -> bool {
        self.transition(FAILED | ((errno as usize) << PAYLOAD_SHIFT))
    }

    /// Take a consumed `Ready` status back to `Submitted` so the operation
    /// can be re-armed after `EAGAIN`. Fails for any other status.
    pub(crate) fn reset_submitted(&self) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current & STATE_MASK != READY {
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                SUBMITTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Invoke the owning future's waker, if one is registered.
    pub(crate) fn wake(&self) {
        self.waker.wake();
    }

    fn transition(&self, terminal: usize) -> bool {
        // only one terminal transition ever wins; everything after the first
        // is a no-op
        self.status
            .compare_exchange(SUBMITTED, terminal, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("fd", &self.fd)
            .field("status", &self.status())
            .field("submitted_at", &self.submitted_at)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_terminal_transition_wins() {
        let bridge = Bridge::new(0, OpKind::Read, None, None, None);

        assert_eq!(bridge.status(), Status::Submitted);
        assert!(bridge.try_cancel());
        // a completion racing in after the cancel is reported as cancelled
        assert!(!bridge.complete_ready(Readiness::READABLE));
        assert_eq!(bridge.status(), Status::Cancelled);
    }

    #[test]
    fn readiness_round_trips_through_status_word() {
        let bridge = Bridge::new(3, OpKind::Write, None, None, None);
        let bits = Readiness::WRITABLE | Readiness::WRITE_CLOSED;

        assert!(bridge.complete_ready(bits));
        assert_eq!(bridge.status(), Status::Ready(bits));
    }

    #[test]
    fn errno_round_trips_through_status_word() {
        let bridge = Bridge::new(7, OpKind::Connect, None, None, None);

        assert!(bridge.fail(libc::ECONNREFUSED));
        assert_eq!(bridge.status(), Status::Failed(libc::ECONNREFUSED));
    }

    #[test]
    fn rearm_only_from_ready() {
        let bridge = Bridge::new(1, OpKind::Read, None, None, None);

        // not yet completed: nothing to re-arm
        assert!(!bridge.reset_submitted());

        bridge.complete_ready(Readiness::READABLE);
        assert!(bridge.reset_submitted());
        assert_eq!(bridge.status(), Status::Submitted);

        // terminal cancellation is never reset
        bridge.try_cancel();
        assert!(!bridge.reset_submitted());
    }
}
