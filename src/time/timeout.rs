// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::sleep::{sleep, sleep_until, Sleep};
use crate::time::TimeError;
use core::fmt;
use core::future::{Future, IntoFuture};
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use pin_project::pin_project;
use std::time::Instant;

/// Requires a `Future` to complete before the specified duration has elapsed,
/// otherwise resolving to [`Elapsed`].
///
/// This is a race: the inner future is polled first, so if both are ready at
/// the same time the inner result wins.
///
/// # Errors
///
/// Fails when the timer cannot be registered, see [`sleep`].
pub fn timeout<F>(duration: Duration, future: F) -> Result<Timeout<F::IntoFuture>, TimeError>
where
    F: IntoFuture,
{
    Ok(Timeout {
        sleep: sleep(duration)?,
        future: future.into_future(),
    })
}

/// Requires a `Future` to complete before the specified deadline has been
/// reached.
///
/// # Errors
///
/// Fails when the timer cannot be registered, see [`sleep_until`].
pub fn timeout_at<F>(deadline: Instant, future: F) -> Result<Timeout<F::IntoFuture>, TimeError>
where
    F: IntoFuture,
{
    Ok(Timeout {
        sleep: sleep_until(deadline)?,
        future: future.into_future(),
    })
}

/// Future returned by [`timeout`] and [`timeout_at`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<F> {
    #[pin]
    sleep: Sleep,
    #[pin]
    future: F,
}

/// The deadline expired before the wrapped future resolved.
#[derive(Debug, PartialEq, Eq)]
pub struct Elapsed(());

impl<F> Timeout<F> {
    /// Gets a reference to the underlying future in this timeout.
    pub fn get_ref(&self) -> &F {
        &self.future
    }

    /// Gets a mutable reference to the underlying future in this timeout.
    pub fn get_mut(&mut self) -> &mut F {
        &mut self.future
    }

    /// Consumes this timeout, returning the underlying future.
    pub fn into_inner(self) -> F {
        self.future
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.project();

        if let Poll::Ready(v) = me.future.poll(cx) {
            return Poll::Ready(Ok(v));
        }

        match me.sleep.poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed(()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deadline has elapsed")
    }
}

impl core::error::Error for Elapsed {}
