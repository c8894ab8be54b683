// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Yields execution back to the scheduler.
///
/// The calling task is rescheduled at the back of its worker's run queue, so
/// other runnable tasks on the same worker get a chance to run before it is
/// polled again.
pub async fn yield_now() {
    /// A future that is pending exactly once.
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            if self.yielded {
                return Poll::Ready(());
            }

            self.yielded = true;
            // waking ourselves before returning `Pending` makes the scheduler
            // requeue the task instead of parking it
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    YieldNow { yielded: false }.await;
}
