// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multi-threaded, work-stealing async runtime.
//!
//! `corvid` drives a large number of cooperative tasks ([`Future`]s) across a
//! small pool of OS threads. It is built from three tightly coupled pieces:
//!
//! - the **task layer** ([`task`]): a type-erased, reference-counted task
//!   allocation whose wakers re-enqueue it through an atomic state protocol,
//! - the **scheduler**: per-worker bounded run queues with lock-free
//!   stealing, a one-element LIFO slot for wake-to-run latency, and a global
//!   injection queue visited on a fixed interval for fairness,
//! - the **reactor** ([`reactor`]): a readiness-based I/O driver (epoll on
//!   Linux, kqueue on the BSDs and macOS, via `mio`) that turns OS readiness
//!   events and timer deadlines into [`Waker`] invocations.
//!
//! The [`runtime`] module ties them together behind a [`Runtime`] facade:
//!
//! ```no_run
//! let mut rt = corvid::Builder::new().build().unwrap();
//! rt.start();
//!
//! let out = rt.block_on(async {
//!     let handle = corvid::spawn(async { 6 * 7 }).unwrap();
//!     handle.await.unwrap()
//! });
//! assert_eq!(out, 42);
//!
//! rt.shutdown();
//! ```
//!
//! Tasks are cooperative: they only yield by returning [`Poll::Pending`], and
//! a per-poll budget forces compute-heavy tasks back into the run queue
//! periodically so no task can monopolize its worker.
//!
//! [`Future`]: core::future::Future
//! [`Waker`]: core::task::Waker
//! [`Poll::Pending`]: core::task::Poll::Pending

#![warn(unsafe_op_in_unsafe_fn)]

mod error;
mod loom;
mod park;
pub mod reactor;
pub mod runtime;
mod scheduler;
pub mod sync;
pub mod task;
pub mod time;
mod util;

pub use error::{NoRuntime, SpawnError};
pub use futures::future;
pub use runtime::{spawn, Builder, Handle, Runtime};
pub use task::JoinHandle;

// the scenario suite drives real worker threads, which loom cannot model
#[cfg(all(test, not(loom)))]
mod tests;
#[cfg(test)]
mod test_util;
