// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread parking: how workers (and `block_on` callers) go to sleep when
//! there is no work, and how publishers wake them back up.

mod parker;
mod parking_lot;

use crate::loom::sync::{Condvar, Mutex};

pub(crate) use parker::{Parker, UnparkToken};
pub(crate) use parking_lot::ParkingLot;

pub(crate) trait Park {
    /// Block the calling thread until [`unpark`](Self::unpark) is called.
    ///
    /// An unpark that happened *before* the park must make it return
    /// immediately (the token is not lost); spurious returns are permitted.
    fn park(&self);
    /// Wake the parked thread (or make its next park return immediately).
    fn unpark(&self);
}

/// A [`Park`] implementation backed by a mutex and condition variable.
#[derive(Debug)]
pub(crate) struct StdPark {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl StdPark {
    pub(crate) fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl Park for StdPark {
    fn park(&self) {
        let mut notified = self.notified.lock().unwrap();
        while !*notified {
            notified = self.condvar.wait(notified).unwrap();
        }
        // consume the token
        *notified = false;
    }

    fn unpark(&self) {
        *self.notified.lock().unwrap() = true;
        self.condvar.notify_one();
    }
}
