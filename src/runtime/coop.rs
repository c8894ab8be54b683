// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The cooperative budget.
//!
//! Every task poll starts with a fixed budget; the leaf operations this
//! runtime provides (reactor ops, timers, join handles) each consume one unit
//! through [`poll_proceed`]. A task that keeps hitting ready leaves would
//! otherwise never return to the scheduler; once the budget is spent,
//! `poll_proceed` reports `Pending` *after waking the task again*, which the
//! scheduler observes as "requeue at the back of the run queue". No task can
//! monopolize its worker.

use core::cell::Cell;
use core::task::{Context, Poll};

/// The budget a task poll starts with.
const INITIAL_BUDGET: u8 = 128;

thread_local! {
    static BUDGET: Cell<u8> = Cell::new(INITIAL_BUDGET);
}

/// Refill the budget; called by the scheduler before each task poll (and by
/// `block_on` before polling the outer future).
pub(crate) fn reset() {
    BUDGET.with(|budget| budget.set(INITIAL_BUDGET));
}

/// Consume one unit of budget.
///
/// Returns `Ready` while budget remains. Once it is exhausted this wakes the
/// calling task and returns `Pending`, forcing a yield through the normal
/// wake machinery.
pub(crate) fn poll_proceed(cx: &mut Context<'_>) -> Poll<()> {
    BUDGET.with(|budget| {
        let remaining = budget.get();
        if remaining == 0 {
            tracing::trace!("cooperative budget exhausted, forcing yield");
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        budget.set(remaining - 1);
        Poll::Ready(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::noop_waker;

    #[test]
    fn budget_runs_out() {
        reset();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        for _ in 0..INITIAL_BUDGET {
            assert!(poll_proceed(&mut cx).is_ready());
        }
        assert!(poll_proceed(&mut cx).is_pending());

        // a fresh poll starts over
        reset();
        assert!(poll_proceed(&mut cx).is_ready());
    }
}
