// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level synchronization building blocks for leaf futures.
//!
//! Higher-level primitives (channels, mutexes, semaphores) are out of scope
//! for this crate; they are expected to be built on top of [`WaitCell`] and
//! the reactor's operation interface.

mod wait_cell;

pub use wait_cell::WaitCell;
