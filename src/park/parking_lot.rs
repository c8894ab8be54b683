// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::loom::sync::Mutex;
use crate::park::parker::{Parker, UnparkToken};
use crate::park::Park;

/// The set of currently parked workers.
///
/// Publishers (spawn, wake) call [`unpark_one`] after placing work; parking
/// workers register themselves here *before* their final idle check, so a
/// wake that races the park either sees the published work or pops the
/// freshly registered token. Either way no wake is lost.
///
/// [`unpark_one`]: Self::unpark_one
#[derive(Debug)]
pub(crate) struct ParkingLot<P> {
    /// Number of parked workers.
    num_parked: AtomicUsize,
    unpark_tokens: Mutex<Vec<(usize, UnparkToken<P>)>>,
}

// === impl ParkingLot ===

impl<P: Park + Send + Sync> ParkingLot<P> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            num_parked: AtomicUsize::new(0),
            unpark_tokens: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.num_parked.load(Ordering::Acquire)
    }

    /// Park the calling worker.
    ///
    /// `still_idle` is evaluated *after* the worker's token is registered: if
    /// it reports that work appeared in the meantime, the park is skipped.
    /// Combined with publishers pushing work before calling [`unpark_one`],
    /// this double-check closes the race between "checked the queues" and
    /// "went to sleep".
    ///
    /// [`unpark_one`]: Self::unpark_one
    pub(crate) fn park(&self, id: usize, parker: Parker<P>, still_idle: impl FnOnce() -> bool) {
        self.transition_to_parked();

        self.unpark_tokens
            .lock()
            .unwrap()
            .push((id, parker.clone().into_unpark()));

        if still_idle() {
            parker.park();
        } else {
            // work raced in; withdraw the registration instead of sleeping.
            // If a publisher already popped our token, its notification is
            // stored in the parker and the *next* park returns immediately,
            // so it is still not lost.
            self.unpark_tokens
                .lock()
                .unwrap()
                .retain(|(token_id, _)| *token_id != id);
        }

        self.transition_from_parked();
    }

    /// Unpark a single worker. Returns `true` when a target was unparked and
    /// `false` when no one was parked.
    ///
    /// Which worker is woken is arbitrary and may change at any point.
    pub(crate) fn unpark_one(&self) -> bool {
        if let Some((_, token)) = self.unpark_tokens.lock().unwrap().pop() {
            token.unpark();
            true
        } else {
            false
        }
    }

    /// Unpark all currently parked workers, returning how many were unparked.
    pub(crate) fn unpark_all(&self) -> usize {
        let mut tokens = self.unpark_tokens.lock().unwrap();
        let mut unparked = 0;

        while let Some((_, token)) = tokens.pop() {
            token.unpark();
            unparked += 1;
        }

        unparked
    }

    fn transition_to_parked(&self) {
        let prev = self.num_parked.fetch_add(1, Ordering::Release);
        debug_assert_ne!(prev, usize::MAX);
    }

    fn transition_from_parked(&self) {
        let prev = self.num_parked.fetch_sub(1, Ordering::Release);
        debug_assert_ne!(prev, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;
    use crate::loom::thread;
    use crate::park::StdPark;
    use crate::util::Backoff;

    #[test]
    fn parking_lot_basically_works() {
        loom::model(|| {
            loom::lazy_static! {
                static ref UNPARKED: AtomicUsize = AtomicUsize::new(0);
            }

            let lot: Arc<ParkingLot<StdPark>> = Arc::new(ParkingLot::with_capacity(4));

            let joins: Vec<_> = (0..4)
                .map(|id| {
                    let lot = lot.clone();
                    thread::spawn(move || {
                        lot.park(id, Parker::new(StdPark::new()), || true);
                        UNPARKED.fetch_add(1, Ordering::Release);
                    })
                })
                .collect();

            for _ in 0..4 {
                let mut boff = Backoff::new();
                while !lot.unpark_one() {
                    boff.spin();
                }
            }

            for join in joins {
                join.join().unwrap();
            }

            assert_eq!(UNPARKED.load(Ordering::Acquire), 4);
        });
    }

    #[test]
    fn skipped_park_withdraws_token() {
        loom::model(|| {
            let lot: ParkingLot<StdPark> = ParkingLot::with_capacity(1);

            // work appears during the double-check: the worker must not sleep
            lot.park(0, Parker::new(StdPark::new()), || false);

            // and its token must be gone, so publishers don't waste signals
            assert!(!lot.unpark_one());
            assert_eq!(lot.num_parked(), 0);
        });
    }
}
