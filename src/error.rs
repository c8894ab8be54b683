// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Error returned by [`Runtime::try_spawn`] and friends when the runtime
/// cannot accept new tasks.
///
/// [`Runtime::try_spawn`]: crate::runtime::Runtime::try_spawn
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum SpawnError {
    /// The runtime has been built but [`Runtime::start`] has not been called
    /// yet, so there are no workers to run the task.
    ///
    /// [`Runtime::start`]: crate::runtime::Runtime::start
    NotStarted,
    /// The runtime is shutting down (or has shut down) and no longer accepts
    /// tasks.
    Shutdown,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::NotStarted => f.write_str("runtime has not been started"),
            SpawnError::Shutdown => f.write_str("runtime is shutting down"),
        }
    }
}

impl core::error::Error for SpawnError {}

/// Error returned by operations that need a runtime context (such as
/// [`spawn`] or [`time::sleep`]) when the calling thread has none installed.
///
/// A runtime context is installed on worker threads and inside
/// [`Runtime::block_on`].
///
/// [`spawn`]: crate::runtime::spawn
/// [`time::sleep`]: crate::time::sleep
/// [`Runtime::block_on`]: crate::runtime::Runtime::block_on
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NoRuntime(pub(crate) ());

impl fmt::Display for NoRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no runtime on this thread")
    }
}

impl core::error::Error for NoRuntime {}
