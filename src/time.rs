// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timer futures built on the reactor's timeout operations.

mod sleep;
mod timeout;

use crate::error::NoRuntime;
use crate::reactor::OpError;
use core::fmt;

pub use sleep::{sleep, sleep_until, Sleep};
pub use timeout::{timeout, timeout_at, Elapsed, Timeout};

/// Error constructing a timer future.
#[derive(Debug)]
#[non_exhaustive]
pub enum TimeError {
    /// The calling thread has no runtime context, so there is no reactor to
    /// register the timer with.
    NoRuntime(NoRuntime),
    /// The reactor rejected the timer registration.
    Reactor(OpError),
}

impl fmt::Display for TimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeError::NoRuntime(err) => err.fmt(f),
            TimeError::Reactor(err) => write!(f, "failed to register timer: {err}"),
        }
    }
}

impl core::error::Error for TimeError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            TimeError::NoRuntime(err) => Some(err),
            TimeError::Reactor(err) => Some(err),
        }
    }
}

impl From<NoRuntime> for TimeError {
    fn from(err: NoRuntime) -> Self {
        TimeError::NoRuntime(err)
    }
}

impl From<OpError> for TimeError {
    fn from(err: OpError) -> Self {
        TimeError::Reactor(err)
    }
}
