// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::reactor::{OpError, OpHandle};
use crate::runtime::Handle;
use crate::time::TimeError;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{ready, Context, Poll};
use core::time::Duration;
use std::time::Instant;

/// Wait until `duration` has elapsed.
///
/// # Errors
///
/// Fails with [`TimeError::NoRuntime`] when the calling thread has no runtime
/// context, and with [`TimeError::Reactor`] when the reactor rejects the
/// timer (shut down, poisoned, or out of slots).
pub fn sleep(duration: Duration) -> Result<Sleep, TimeError> {
    sleep_until(Instant::now() + duration)
}

/// Wait until `deadline` has been reached.
///
/// # Errors
///
/// See [`sleep`].
pub fn sleep_until(deadline: Instant) -> Result<Sleep, TimeError> {
    let handle = Handle::try_current()?;
    let op = handle.reactor().submit_timeout(deadline)?;

    Ok(Sleep { deadline, op })
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    deadline: Instant,
    op: OpHandle,
}

impl Sleep {
    /// The instant this `Sleep` resolves at.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.op.poll_ready(cx)) {
            // a timer "completes" by timing out
            Err(OpError::TimedOut) => Poll::Ready(()),
            Ok(readiness) => unreachable!(
                "a timeout operation cannot report readiness (got {readiness:?})"
            ),
            // the reactor is going away; resolving is the least-bad option,
            // the runtime is shutting down anyway
            Err(error) => {
                tracing::debug!(%error, "sleep resolved early");
                Poll::Ready(())
            }
        }
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
