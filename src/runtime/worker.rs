// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker thread: the scheduler's main loop.
//!
//! Each iteration looks for the next task in a fixed order:
//!
//! 1. the LIFO slot (a task just woken from this worker),
//! 2. on every `global_poll_interval`-th iteration, the global injection
//!    queue *first*, bounding how long globally queued tasks can be starved,
//! 3. the worker's own run queue,
//! 4. the global injection queue,
//! 5. stealing from sibling workers (three rounds: random rotation stealing
//!    half, the longest observed victim queue, then batch steals).
//!
//! When all of that comes up empty the worker spins briefly to absorb
//! micro-bursts, then parks. Publishers place work *before* signaling the
//! parking lot, and the parking lot re-checks for work after registering, so
//! the park never races a wake into a lost wakeup.

use crate::runtime::{context, coop, Handle, Shared};
use crate::scheduler::{Core, Tick};
use crate::task::{PollResult, TaskRef};
use crate::util::Backoff;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(super) struct Worker {
    shared: Arc<Shared>,
    core: Box<Core>,
    parker: crate::park::Parker<crate::park::StdPark>,
    rng: fastrand::Rng,
    /// Scheduling decision counter, drives the fairness interval.
    tick: u32,
    is_searching: bool,
}

// === impl Worker ===

impl Worker {
    pub(super) fn new(shared: Arc<Shared>, core: Box<Core>) -> Self {
        let seed = core.index() as u64 + 1;
        Self {
            shared,
            core,
            parker: crate::park::Parker::new(crate::park::StdPark::new()),
            rng: fastrand::Rng::with_seed(seed),
            tick: 0,
            is_searching: false,
        }
    }

    pub(super) fn run(mut self) {
        let _ctx = context::enter(Handle {
            shared: self.shared.clone(),
        });
        // Safety: the guard is dropped below, before `self.core` is
        let worker_ctx = unsafe { context::enter_worker(&self.core, &self.shared) };

        let _span = tracing::debug_span!("worker", worker = self.core.index()).entered();
        tracing::debug!("worker thread running");

        let mut stats = Tick::default();
        loop {
            if self.shared.is_shutdown() {
                break;
            }

            if let Some(task) = self.next_task(&mut stats) {
                self.run_task(task, &mut stats);
                continue;
            }

            if self.spin_for_work() {
                continue;
            }

            if self.shared.is_shutdown() {
                break;
            }

            tracing::trace!(?stats, "out of work, parking");
            stats = Tick::default();
            self.park();
        }

        // wakes arriving from here on land in the injector, where the
        // runtime's shutdown drains them
        drop(worker_ctx);

        tracing::debug!(?stats, "stop signal received, shutting down");
        self.core.shutdown();
    }

    fn next_task(&mut self, stats: &mut Tick) -> Option<TaskRef> {
        self.tick = self.tick.wrapping_add(1);

        // the LIFO slot first: the freshly woken producer/consumer partner
        // of whatever just ran
        if let Some(task) = self.core.take_lifo() {
            return Some(task);
        }

        // every N-th decision, look at the injector *before* local work so a
        // globally queued task is picked up within a bounded number of
        // decisions
        if self.tick % self.shared.config.global_poll_interval == 0 {
            if let Some(task) = self.next_global_task(stats) {
                return Some(task);
            }
        }

        if let Some(task) = self.core.pop() {
            return Some(task);
        }

        if let Some(task) = self.next_global_task(stats) {
            return Some(task);
        }

        if self.shared.config.enable_work_stealing {
            self.steal_work(stats)
        } else {
            None
        }
    }

    fn next_global_task(&mut self, stats: &mut Tick) -> Option<TaskRef> {
        let stealer = self.shared.injector.try_steal().ok()?;
        let task = stealer.pop_one()?;

        // bring a batch along, amortizing the injector synchronization
        let moved = stealer.steal_into(
            self.core.run_queue(),
            self.shared.config.steal_batch_size,
        );
        if moved > 0 {
            stats.stolen += moved;
            tracing::trace!(moved, "refilled local queue from injector");
        }

        Some(task)
    }

    fn steal_work(&mut self, stats: &mut Tick) -> Option<TaskRef> {
        if !self.transition_to_searching() {
            return None;
        }

        let found = self.steal_rounds(stats);
        let was_last_searcher = self.transition_from_searching();

        if found.is_some() {
            stats.stolen += 1;
            if was_last_searcher {
                // we found work as the last active searcher; wake a sibling
                // to keep the search going, there may be more
                self.shared.parking_lot.unpark_one();
            }
        }

        found
    }

    /// Throttle: no more than half of the awake workers search at once,
    /// otherwise an almost-idle runtime burns cycles contending on queues.
    fn transition_to_searching(&mut self) -> bool {
        debug_assert!(!self.is_searching);

        let num_searching = self.shared.num_searching.load(Ordering::Acquire);
        let num_parked = self.shared.parking_lot.num_parked();
        let num_workers = self.shared.remotes.len();

        if 2 * num_searching >= num_workers.saturating_sub(num_parked) {
            return false;
        }

        self.is_searching = true;
        self.shared.num_searching.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Returns `true` if this was the final searching worker.
    fn transition_from_searching(&mut self) -> bool {
        debug_assert!(self.is_searching);
        self.is_searching = false;

        let prev = self.shared.num_searching.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev == 1
    }

    fn steal_rounds(&mut self, stats: &mut Tick) -> Option<TaskRef> {
        let num_workers = self.shared.remotes.len();
        if num_workers <= 1 {
            // no one to steal from; the injector is still worth a look
            return self.next_global_task(stats);
        }

        let mut backoff = Backoff::new();
        let start = self.rng.usize(0..num_workers);

        // round 1: random victim rotation, taking half of the first
        // non-empty queue
        for i in 0..num_workers {
            let victim = (start + i) % num_workers;
            if victim == self.core.index() {
                continue;
            }
            if let Some(task) =
                self.shared.remotes[victim].steal.steal_half_into(self.core.run_queue())
            {
                tracing::trace!(victim, round = 1, "stole tasks");
                return Some(task);
            }
        }
        backoff.spin();

        // round 2: target the victim with the longest observed queue
        let longest = (0..num_workers)
            .filter(|victim| *victim != self.core.index())
            .max_by_key(|victim| self.shared.remotes[*victim].steal.len());
        if let Some(victim) = longest {
            if let Some(task) =
                self.shared.remotes[victim].steal.steal_half_into(self.core.run_queue())
            {
                tracing::trace!(victim, round = 2, "stole tasks");
                return Some(task);
            }
        }
        backoff.spin();

        // round 3: batch-steal up to the configured cap from anyone
        for i in 0..num_workers {
            let victim = (start + i) % num_workers;
            if victim == self.core.index() {
                continue;
            }
            if let Some(task) = self.shared.remotes[victim].steal.steal_into(
                self.core.run_queue(),
                self.shared.config.steal_batch_size,
            ) {
                tracing::trace!(victim, round = 3, "stole tasks");
                return Some(task);
            }
        }

        // last resort: the injector once more before giving up
        self.next_global_task(stats)
    }

    fn run_task(&mut self, task: TaskRef, stats: &mut Tick) {
        let _span = tracing::trace_span!("run", task.tid = task.id().as_u64()).entered();

        coop::reset();
        context::set_current_task(Some(task.id()));
        let result = task.poll();
        context::set_current_task(None);

        stats.polled += 1;
        match result {
            PollResult::Ready | PollResult::ReadyJoined => {
                stats.completed += 1;
                self.shared.release_task(&task);
                drop(task);
            }
            // whoever wakes the task holds a waker clone; our reference is
            // released
            PollResult::Pending => drop(task),
            PollResult::PendingSchedule => {
                // the task woke itself during the poll (or the budget forced
                // a yield): requeue at the *back* so its siblings run first
                self.core
                    .push_back_or_overflow(task, &self.shared.injector);
            }
        }
    }

    /// A short pause-instruction loop before parking, to absorb micro-bursts
    /// without paying for a sleep/wake round trip.
    fn spin_for_work(&mut self) -> bool {
        for _ in 0..self.shared.config.spin_before_park {
            core::hint::spin_loop();
            if self.core.has_work() || !self.shared.injector.is_empty() {
                return true;
            }
        }
        false
    }

    fn park(&mut self) {
        let core = &self.core;
        let shared = &self.shared;

        // the final idle check runs *after* our unpark token is registered;
        // see `ParkingLot::park` for why this cannot lose a wake
        shared.parking_lot.park(core.index(), self.parker.clone(), || {
            !core.has_work() && shared.injector.is_empty() && !shared.is_shutdown()
        });
    }
}
