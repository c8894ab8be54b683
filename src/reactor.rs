// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O reactor: translates OS readiness events and timer deadlines into
//! [`Waker`] invocations.
//!
//! One reactor exists per runtime. The backend is selected by `mio` at
//! compile time (epoll on Linux, kqueue on the BSDs and macOS), which means
//! this is a *readiness* reactor: a completed operation reports *which*
//! nonblocking syscall will now make progress, and the owning future performs
//! that syscall itself on its next poll, looping until `EAGAIN` and
//! [re-arming](OpHandle::rearm) the operation for more.
//!
//! Submitting an operation allocates a completion bridge (see
//! [`bridge`](self::bridge)) and registers the fd with the backend; the
//! returned [`OpHandle`] is polled from inside futures via
//! [`poll_ready`](OpHandle::poll_ready). Dropping an `OpHandle` cancels
//! anything still in flight and releases the registration, so no bridge can
//! outlive its operation.
//!
//! The reactor is driven by a dedicated thread running [`Driver::run`];
//! cross-thread submissions interrupt its blocking poll through a `mio`
//! waker so new deadlines take effect immediately.
//!
//! Note that the fd-based operations register *one* backend interest per fd:
//! submitting a second operation for an fd that already has one in flight
//! fails with the backend's registration error.
//!
//! [`Waker`]: core::task::Waker

mod bridge;

use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::sync::{Arc, Mutex};
use crate::runtime::coop;
use bridge::{Bridge, Status};
use core::fmt;
use core::task::{ready, Context, Poll};
use core::time::Duration;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use slab::Slab;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

pub use bridge::{OpKind, Readiness};

/// The token reserved for the cross-thread wakeup pipe.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Which OS readiness backend the reactor uses.
///
/// The backend is fixed at compile time by the target platform; naming one
/// explicitly merely asserts that it matches, so a deployment pinned to e.g.
/// epoll fails loudly when built for the wrong OS instead of silently running
/// on another backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Backend {
    /// Use whatever the platform provides (epoll on Linux, kqueue on the
    /// BSDs and macOS).
    #[default]
    Auto,
    /// Require epoll (Linux).
    Epoll,
    /// Require kqueue (macOS and the BSDs).
    Kqueue,
}

impl Backend {
    /// The backend the current platform compiles to.
    pub fn current() -> Backend {
        if cfg!(target_os = "linux") {
            Backend::Epoll
        } else {
            Backend::Kqueue
        }
    }

    pub(crate) fn check(self) -> io::Result<()> {
        let current = Self::current();
        if self == Backend::Auto || self == current {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("reactor backend {self:?} is not available on this platform (have {current:?})"),
            ))
        }
    }
}

/// Errors surfaced by reactor operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum OpError {
    /// The underlying syscall or backend registration failed.
    Io(io::Error),
    /// The operation's deadline expired before it completed.
    TimedOut,
    /// The operation was cancelled.
    Cancelled,
    /// The reactor is at its configured queue depth and cannot track another
    /// operation.
    Exhausted,
    /// The reactor has been closed (the runtime is shutting down).
    Closed,
    /// The reactor was poisoned by a fatal backend error.
    Poisoned,
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::Io(err) => write!(f, "i/o error: {err}"),
            OpError::TimedOut => f.write_str("operation timed out"),
            OpError::Cancelled => f.write_str("operation was cancelled"),
            OpError::Exhausted => f.write_str("reactor is out of completion slots"),
            OpError::Closed => f.write_str("reactor is closed"),
            OpError::Poisoned => f.write_str("reactor was poisoned by a fatal backend error"),
        }
    }
}

impl core::error::Error for OpError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            OpError::Io(err) => Some(err),
            _ => None,
        }
    }
}

struct Shared {
    registry: mio::Registry,
    /// Interrupts the driver's blocking poll (new timer, close request).
    waker: mio::Waker,
    /// All in-flight operations, keyed by their backend token.
    ops: Mutex<Slab<Arc<Bridge>>>,
    /// Deadlines, ordered soonest-first. The `usize` is the op key, breaking
    /// ties between identical instants.
    timers: Mutex<BTreeMap<(Instant, usize), Arc<Bridge>>>,
    queue_depth: usize,
    closed: AtomicBool,
    poisoned: AtomicBool,
}

/// Owns the backend poll; runs on the dedicated reactor thread.
pub(crate) struct Driver {
    poll: mio::Poll,
    events: mio::Events,
    shared: Arc<Shared>,
}

/// A cheaply cloneable handle used to submit operations to the reactor.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

/// An in-flight reactor operation.
///
/// Polled from inside futures via [`poll_ready`](Self::poll_ready). Dropping
/// the handle cancels the operation (best-effort) and releases its
/// registration and completion bridge.
pub struct OpHandle {
    bridge: Arc<Bridge>,
    shared: Arc<Shared>,
}

/// Create a reactor, returning the driver (for the reactor thread) and the
/// submission handle.
pub(crate) fn new(queue_depth: usize) -> io::Result<(Driver, Handle)> {
    let poll = mio::Poll::new()?;
    let registry = poll.registry().try_clone()?;
    let waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;

    let shared = Arc::new(Shared {
        registry,
        waker,
        ops: Mutex::new(Slab::with_capacity(queue_depth.min(1024))),
        timers: Mutex::new(BTreeMap::new()),
        queue_depth,
        closed: AtomicBool::new(false),
        poisoned: AtomicBool::new(false),
    });

    let driver = Driver {
        poll,
        events: mio::Events::with_capacity(queue_depth.clamp(64, 1024)),
        shared: shared.clone(),
    };

    Ok((driver, Handle { shared }))
}

// === impl Driver ===

impl Driver {
    /// Drive the reactor until it is closed or poisoned. This is the body of
    /// the dedicated reactor thread.
    pub(crate) fn run(mut self) {
        let _span = tracing::debug_span!("reactor").entered();

        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                break;
            }

            match self.poll_once(None) {
                Ok(dispatched) => {
                    if dispatched > 0 {
                        tracing::trace!(dispatched, "dispatched completions");
                    }
                }
                Err(error) => {
                    tracing::error!(%error, "fatal backend error, poisoning reactor");
                    self.shared.poison();
                    break;
                }
            }
        }

        self.shared.drain();
        tracing::debug!("reactor thread exiting");
    }

    /// One reactor turn: block on the backend for at most `max_wait` (bounded
    /// further by the next timer deadline), dispatch completions, fire due
    /// timers. Returns the number of completions dispatched.
    pub(crate) fn poll_once(&mut self, max_wait: Option<Duration>) -> io::Result<usize> {
        let timeout = {
            let now = Instant::now();
            let next_deadline = self
                .shared
                .timers
                .lock()
                .unwrap()
                .keys()
                .next()
                .map(|(when, _)| when.saturating_duration_since(now));
            match (next_deadline, max_wait) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, b) => b,
            }
        };

        if let Err(error) = self.poll.poll(&mut self.events, timeout) {
            // a signal interrupting the poll is not an error, just retry
            if error.kind() != io::ErrorKind::Interrupted {
                return Err(error);
            }
        }

        let mut dispatched = 0;
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }

            let bridge = self.shared.ops.lock().unwrap().get(token.0).cloned();
            let Some(bridge) = bridge else {
                // the op was cancelled and reclaimed before we got here
                continue;
            };

            let readiness = Readiness::from_mio(event);
            if bridge.complete_ready(readiness) {
                tracing::trace!(op.key = token.0, ?readiness, "operation ready");
                bridge.wake();
                dispatched += 1;
            }
        }

        dispatched += self.shared.fire_timers(Instant::now());
        Ok(dispatched)
    }
}

// === impl Shared ===

impl Shared {
    /// Fire every timer whose deadline has passed. Returns how many fired.
    fn fire_timers(&self, now: Instant) -> usize {
        let due = {
            let mut timers = self.timers.lock().unwrap();
            // everything strictly after `now` stays; the rest is due
            let later = timers.split_off(&(now, usize::MAX));
            core::mem::replace(&mut *timers, later)
        };

        let mut fired = 0;
        for ((deadline, key), bridge) in due {
            if bridge.complete_timed_out() {
                tracing::trace!(op.key = key, ?deadline, "deadline elapsed");
                bridge.wake();
                fired += 1;
            }
        }
        fired
    }

    /// Fail every outstanding operation; called on a fatal backend error.
    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);

        let ops: Vec<Arc<Bridge>> = self
            .ops
            .lock()
            .unwrap()
            .iter()
            .map(|(_, bridge)| bridge.clone())
            .collect();

        for bridge in ops {
            if bridge.fail(libc::EIO) {
                bridge.wake();
            }
        }
        self.timers.lock().unwrap().clear();
    }

    /// Cancel every outstanding operation; called when the reactor closes.
    fn drain(&self) {
        let ops: Vec<Arc<Bridge>> = self
            .ops
            .lock()
            .unwrap()
            .iter()
            .map(|(_, bridge)| bridge.clone())
            .collect();

        for bridge in ops {
            if bridge.try_cancel() {
                bridge.wake();
            }
        }
        self.timers.lock().unwrap().clear();
    }
}

// === impl Handle ===

impl Handle {
    /// Register interest in `fd` becoming readable.
    pub fn submit_read(
        &self,
        fd: RawFd,
        deadline: Option<Instant>,
    ) -> Result<OpHandle, OpError> {
        self.submit(Some((fd, Interest::READABLE)), OpKind::Read, deadline)
    }

    /// Register interest in `fd` becoming writable.
    pub fn submit_write(
        &self,
        fd: RawFd,
        deadline: Option<Instant>,
    ) -> Result<OpHandle, OpError> {
        self.submit(Some((fd, Interest::WRITABLE)), OpKind::Write, deadline)
    }

    /// Register interest in a listening socket having a connection to accept.
    pub fn submit_accept(
        &self,
        listen_fd: RawFd,
        deadline: Option<Instant>,
    ) -> Result<OpHandle, OpError> {
        self.submit(Some((listen_fd, Interest::READABLE)), OpKind::Accept, deadline)
    }

    /// Register interest in a connect-in-progress on `fd` resolving. The
    /// nonblocking `connect` itself is issued by the caller beforehand.
    pub fn submit_connect(
        &self,
        fd: RawFd,
        deadline: Option<Instant>,
    ) -> Result<OpHandle, OpError> {
        self.submit(Some((fd, Interest::WRITABLE)), OpKind::Connect, deadline)
    }

    /// Submit a one-shot timer firing at `deadline`.
    ///
    /// The operation "completes" by timing out; its [`poll_ready`] resolves
    /// to [`OpError::TimedOut`] once the deadline passed.
    ///
    /// [`poll_ready`]: OpHandle::poll_ready
    pub fn submit_timeout(&self, deadline: Instant) -> Result<OpHandle, OpError> {
        self.submit(None, OpKind::Timeout, Some(deadline))
    }

    /// Close `fd`. Readiness backends have no asynchronous close, so the
    /// syscall is issued inline and the returned operation is already
    /// complete.
    pub fn submit_close(&self, fd: RawFd) -> Result<OpHandle, OpError> {
        let op = self.submit(None, OpKind::Close, None)?;
        // Safety: plain close(2); an invalid fd is reported through errno
        if unsafe { libc::close(fd) } == 0 {
            op.bridge.complete_ready(Readiness::empty());
        } else {
            op.bridge.fail(last_errno());
        }
        Ok(op)
    }

    /// Flush `fd` to stable storage. Like [`submit_close`](Self::submit_close)
    /// this completes inline on a readiness backend.
    pub fn submit_fsync(&self, fd: RawFd) -> Result<OpHandle, OpError> {
        let op = self.submit(None, OpKind::Fsync, None)?;
        // Safety: plain fsync(2); failures are reported through errno
        if unsafe { libc::fsync(fd) } == 0 {
            op.bridge.complete_ready(Readiness::empty());
        } else {
            op.bridge.fail(last_errno());
        }
        Ok(op)
    }

    /// Request cancellation of an in-flight operation. Best-effort: the
    /// operation may already have completed, in which case its result stands.
    pub fn cancel(&self, op: &OpHandle) {
        op.cancel();
    }

    /// Stop accepting submissions and wake the driver so it can cancel all
    /// outstanding operations and exit.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
    }

    /// The number of operations currently tracked.
    pub fn in_flight(&self) -> usize {
        self.shared.ops.lock().unwrap().len()
    }

    fn submit(
        &self,
        source: Option<(RawFd, Interest)>,
        kind: OpKind,
        deadline: Option<Instant>,
    ) -> Result<OpHandle, OpError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(OpError::Closed);
        }
        if self.shared.poisoned.load(Ordering::Acquire) {
            return Err(OpError::Poisoned);
        }

        let bridge = {
            let mut ops = self.shared.ops.lock().unwrap();
            if ops.len() >= self.shared.queue_depth {
                return Err(OpError::Exhausted);
            }

            let entry = ops.vacant_entry();
            let key = entry.key();
            let bridge = Arc::new(Bridge::new(
                key,
                kind,
                source.map(|(fd, _)| fd),
                source.map(|(_, interest)| interest),
                deadline,
            ));

            if let Some((fd, interest)) = source {
                self.shared
                    .registry
                    .register(&mut SourceFd(&fd), Token(key), interest)
                    .map_err(OpError::Io)?;
            }

            entry.insert(bridge.clone());
            bridge
        };

        if let Some(deadline) = deadline {
            self.shared
                .timers
                .lock()
                .unwrap()
                .insert((deadline, bridge.key()), bridge.clone());
            // nudge the driver out of its blocking poll so the new deadline
            // takes effect
            let _ = self.shared.waker.wake();
        }

        tracing::trace!(op.key = bridge.key(), op.kind = ?kind, "submitted operation");
        Ok(OpHandle {
            bridge,
            shared: self.shared.clone(),
        })
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("reactor::Handle")
            .field("in_flight", &self.in_flight())
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl OpHandle ===

impl OpHandle {
    pub fn kind(&self) -> OpKind {
        self.bridge.kind()
    }

    /// Poll the operation for completion, registering the [`Context`]'s
    /// waker to be invoked when the backend reports it.
    ///
    /// This is the call I/O futures make from their own `poll`; the waker
    /// registration happens *before* the final status check, so a completion
    /// racing in between is never lost.
    pub fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<Readiness, OpError>> {
        ready!(coop::poll_proceed(cx));

        loop {
            match self.bridge.status() {
                Status::Ready(readiness) => return Poll::Ready(Ok(readiness)),
                Status::TimedOut => return Poll::Ready(Err(OpError::TimedOut)),
                Status::Cancelled => return Poll::Ready(Err(OpError::Cancelled)),
                Status::Failed(errno) => {
                    return Poll::Ready(Err(OpError::Io(io::Error::from_raw_os_error(errno))))
                }
                Status::Submitted => {}
            }

            match self.bridge.waker().poll_wait(cx) {
                Poll::Pending => {
                    // waker registered; re-check in case the completion raced
                    // the registration
                    if matches!(self.bridge.status(), Status::Submitted) {
                        return Poll::Pending;
                    }
                    // a completion landed mid-registration, read it next turn
                }
                // a pending notification was consumed, re-read the status
                Poll::Ready(()) => {}
            }
        }
    }

    /// Re-arm a consumed readiness operation after the caller drained the fd
    /// to `EAGAIN`: the status goes back to in-flight and the backend
    /// registration is refreshed.
    pub fn rearm(&self) -> Result<(), OpError> {
        let (fd, interest) = match (self.bridge.fd(), self.bridge.interest()) {
            (Some(fd), Some(interest)) => (fd, interest),
            _ => {
                return Err(OpError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "operation has no fd registration to re-arm",
                )))
            }
        };

        match self.bridge.status() {
            // already armed, nothing to do
            Status::Submitted => return Ok(()),
            Status::Ready(_) => {}
            Status::TimedOut => return Err(OpError::TimedOut),
            Status::Cancelled => return Err(OpError::Cancelled),
            Status::Failed(errno) => {
                return Err(OpError::Io(io::Error::from_raw_os_error(errno)))
            }
        }

        // reset *before* refreshing the registration: the next edge may fire
        // immediately, and a completion against a still-`Ready` bridge would
        // be dropped
        if !self.bridge.reset_submitted() {
            // someone else consumed/cancelled in between; report the fresh
            // status on the next poll
            return Ok(());
        }

        self.shared
            .registry
            .reregister(&mut SourceFd(&fd), Token(self.bridge.key()), interest)
            .map_err(OpError::Io)?;
        Ok(())
    }

    /// Request cancellation. Best-effort: an already-completed operation
    /// keeps its result, anything still in flight resolves to
    /// [`OpError::Cancelled`].
    pub fn cancel(&self) {
        if self.bridge.try_cancel() {
            tracing::trace!(op.key = self.bridge.key(), "cancelled operation");
            self.bridge.wake();
        }
    }
}

impl Drop for OpHandle {
    fn drop(&mut self) {
        // best-effort cancel of anything still in flight; nobody is left to
        // observe the status, so no wake
        self.bridge.try_cancel();

        if let Some(fd) = self.bridge.fd() {
            let _ = self.shared.registry.deregister(&mut SourceFd(&fd));
        }
        if let Some(deadline) = self.bridge.deadline() {
            self.shared
                .timers
                .lock()
                .unwrap()
                .remove(&(deadline, self.bridge.key()));
        }
        self.shared.ops.lock().unwrap().try_remove(self.bridge.key());
    }
}

impl fmt::Debug for OpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bridge.fmt(f)
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}
