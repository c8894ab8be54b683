// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driving the whole runtime: scheduler, reactor and
//! task layer together.

use crate::runtime::{spawn, Builder, Runtime};
use crate::sync::WaitCell;
use crate::test_util::trace_init;
use crate::{future, time};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use core::time::Duration;
use std::future::poll_fn;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn runtime(workers: usize) -> Runtime {
    let mut rt = Builder::new()
        .worker_threads(workers)
        .build()
        .expect("failed to build runtime");
    rt.start();
    rt
}

/// Wait until `cell` delivers a notification.
async fn signaled(cell: &WaitCell) {
    poll_fn(|cx| cell.poll_wait(cx)).await;
}

/// Poll `condition` until it holds, sleeping on `cell` in between.
///
/// The waker registration happens before the final re-check, so a
/// notification racing the check is never lost.
async fn wait_until(cell: &WaitCell, mut condition: impl FnMut() -> bool) {
    poll_fn(|cx| loop {
        if condition() {
            return Poll::Ready(());
        }
        match cell.poll_wait(cx) {
            // consumed a pending notification; re-check
            Poll::Ready(()) => {}
            Poll::Pending => {
                if condition() {
                    return Poll::Ready(());
                }
                return Poll::Pending;
            }
        }
    })
    .await;
}

/// Asserts that the scheduler never polls a future again once it returned
/// `Ready`.
struct FuseCheck<F> {
    inner: F,
    done: bool,
}

impl<F> FuseCheck<F> {
    fn new(inner: F) -> Self {
        Self { inner, done: false }
    }
}

impl<F: Future + Unpin> Future for FuseCheck<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        assert!(!self.done, "future polled again after it returned Ready");
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(output) => {
                self.done = true;
                Poll::Ready(output)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[test]
fn spawn_many_join_all() {
    let _trace = trace_init();
    let mut rt = runtime(4);

    let outputs = rt.block_on(async {
        let handles: Vec<_> = (0..1000)
            .map(|i| spawn(async move { i }).unwrap())
            .collect();
        future::join_all(handles).await
    });

    let mut got: Vec<usize> = outputs.into_iter().map(|out| out.unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, (0..1000).collect::<Vec<_>>());

    rt.shutdown();
}

#[test]
fn bounded_channel_ping_pong() {
    // A capacity-1 rendezvous built from two WaitCells; the producer sends
    // 1..=100 and the consumer sums them.
    struct Channel {
        slot: Mutex<Option<i64>>,
        producer_waits: WaitCell,
        consumer_waits: WaitCell,
    }

    impl Channel {
        fn new() -> Self {
            Self {
                slot: Mutex::new(None),
                producer_waits: WaitCell::new(),
                consumer_waits: WaitCell::new(),
            }
        }

        async fn send(&self, value: i64) {
            let mut value = Some(value);
            wait_until(&self.producer_waits, || {
                let mut slot = self.slot.lock().unwrap();
                if slot.is_none() {
                    *slot = value.take();
                    true
                } else {
                    false
                }
            })
            .await;
            self.consumer_waits.wake();
        }

        async fn recv(&self) -> i64 {
            let mut received = None;
            wait_until(&self.consumer_waits, || {
                if let Some(value) = self.slot.lock().unwrap().take() {
                    received = Some(value);
                    true
                } else {
                    false
                }
            })
            .await;
            self.producer_waits.wake();
            received.unwrap()
        }
    }

    let _trace = trace_init();
    let mut rt = runtime(2);

    let sum = rt.block_on(async {
        let channel = Arc::new(Channel::new());

        let producer = {
            let channel = channel.clone();
            spawn(async move {
                for i in 1..=100 {
                    channel.send(i).await;
                }
            })
            .unwrap()
        };

        let consumer = {
            let channel = channel.clone();
            spawn(async move {
                let mut sum = 0;
                for _ in 0..100 {
                    sum += channel.recv().await;
                }
                sum
            })
            .unwrap()
        };

        producer.await.unwrap();
        consumer.await.unwrap()
    });

    assert_eq!(sum, 5050);
    rt.shutdown();
}

#[test]
fn reactor_pipe_read_write() {
    const MSG: &[u8; 16] = b"helloworld012345";

    let _trace = trace_init();
    let mut rt = runtime(2);

    let (sender, receiver) = mio::unix::pipe::new().expect("failed to create pipe");

    let (read, written) = rt.block_on(async move {
        let reactor = crate::Handle::current().reactor().clone();

        let reader = {
            let reactor = reactor.clone();
            spawn(async move {
                let op = reactor.submit_read(receiver.as_raw_fd(), None).unwrap();
                let readiness = poll_fn(|cx| op.poll_ready(cx)).await.unwrap();
                assert!(readiness.contains(crate::reactor::Readiness::READABLE));

                let mut buf = [0_u8; 16];
                // Safety: reading into a valid, exactly 16-byte buffer
                let n = unsafe {
                    libc::read(receiver.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                assert_eq!(n, 16, "the pipe write is atomic, all 16 bytes arrive");
                buf
            })
            .unwrap()
        };

        let writer = spawn(async move {
            let op = reactor.submit_write(sender.as_raw_fd(), None).unwrap();
            let readiness = poll_fn(|cx| op.poll_ready(cx)).await.unwrap();
            assert!(readiness.contains(crate::reactor::Readiness::WRITABLE));

            // Safety: writing from a valid 16-byte buffer
            let n = unsafe { libc::write(sender.as_raw_fd(), MSG.as_ptr().cast(), MSG.len()) };
            n
        })
        .unwrap();

        let read = reader.await.unwrap();
        let written = writer.await.unwrap();
        (read, written)
    });

    assert_eq!(&read, MSG);
    assert_eq!(written, 16);
    rt.shutdown();
}

#[test]
fn timeout_fires() {
    let _trace = trace_init();
    let mut rt = runtime(1);

    let begin = std::time::Instant::now();
    let result = rt.block_on(async {
        time::timeout(Duration::from_millis(50), future::pending::<()>())
            .unwrap()
            .await
    });

    result.expect_err("the wrapped future never completes, the timeout must win");
    assert!(
        begin.elapsed() >= Duration::from_millis(50),
        "timeout fired early"
    );
    rt.shutdown();
}

#[test]
fn sleep_sleeps() {
    let _trace = trace_init();
    let mut rt = runtime(1);

    rt.block_on(async {
        let begin = std::time::Instant::now();
        time::sleep(Duration::from_millis(100)).unwrap().await;
        let elapsed = begin.elapsed();
        assert!(
            elapsed >= Duration::from_millis(100),
            "expected to sleep at least 100ms, got {elapsed:?}"
        );
    });

    rt.shutdown();
}

#[test]
fn timer_without_runtime_errors() {
    // awaiting time without an event loop on the thread is an error, never a
    // silent synchronous fallback
    assert!(matches!(
        time::sleep(Duration::from_millis(1)),
        Err(time::TimeError::NoRuntime(_))
    ));
}

#[test]
fn wake_chain() {
    // A chain of 100_000 tasks, each woken by its predecessor; the last one
    // signals completion. Exercises wake delivery at volume and (through
    // `FuseCheck`) that no task is polled after completing.
    const CHAIN: usize = 100_000;

    let _trace = trace_init();
    let mut rt = runtime(4);

    let cells: Arc<Vec<WaitCell>> = Arc::new((0..=CHAIN).map(|_| WaitCell::new()).collect());
    let woken = Arc::new(AtomicUsize::new(0));

    for i in 0..CHAIN {
        let cells = cells.clone();
        let woken = woken.clone();
        drop(
            rt.try_spawn(async move {
                FuseCheck::new(Box::pin(async {
                    signaled(&cells[i]).await;
                    woken.fetch_add(1, Ordering::Relaxed);
                    cells[i + 1].wake();
                }))
                .await
            })
            .unwrap(),
        );
    }

    cells[0].wake();

    rt.block_on(async {
        signaled(&cells[CHAIN]).await;
    });

    assert_eq!(woken.load(Ordering::Relaxed), CHAIN);
    rt.shutdown();
}

#[test]
fn task_panic_is_isolated() {
    struct PanicsOnThird {
        polls: u32,
    }

    impl Future for PanicsOnThird {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            self.polls += 1;
            if self.polls == 3 {
                panic!("task blew up on poll #3");
            }
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    let _trace = trace_init();
    let mut rt = runtime(1);

    let err = rt
        .block_on(rt.spawn(PanicsOnThird { polls: 0 }))
        .unwrap_err();
    assert!(err.is_panic());
    let payload = err.into_panic();
    assert_eq!(
        payload.downcast_ref::<&str>(),
        Some(&"task blew up on poll #3")
    );

    // the worker that ran the panicking task must still pick up new work
    let out = rt.block_on(rt.spawn(async { 7 })).unwrap();
    assert_eq!(out, 7);

    rt.shutdown();
}

#[test]
fn abort_cancels_reactor_op() {
    let _trace = trace_init();
    let mut rt = runtime(2);

    // keep the write end alive so the read can never complete on its own
    let (_sender, receiver) = mio::unix::pipe::new().expect("failed to create pipe");
    let reactor = rt.handle().reactor().clone();

    let handle = rt.spawn(async move {
        let op = reactor.submit_read(receiver.as_raw_fd(), None).unwrap();
        let _ = poll_fn(|cx| op.poll_ready(cx)).await;
        unreachable!("the pipe never becomes readable");
    });

    // let the task register its interest before pulling the rug
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(rt.handle().reactor().in_flight(), 1);

    handle.abort();
    let err = rt.block_on(handle).unwrap_err();
    assert!(err.is_cancelled());

    // the op handle died with the task's future: bridge freed, registration
    // gone. Cancellation is asynchronous, so give the worker a moment.
    let mut tries = 0;
    while rt.handle().reactor().in_flight() != 0 {
        std::thread::sleep(Duration::from_millis(10));
        tries += 1;
        assert!(tries < 100, "reactor registration leaked after abort");
    }

    rt.shutdown();
}

#[test]
fn pending_loop_does_not_starve_siblings() {
    // A task that is always "ready to run" but never completes must not
    // prevent other tasks on the same (single) worker from being polled.
    let _trace = trace_init();
    let mut rt = runtime(1);

    let done = Arc::new(AtomicBool::new(false));

    let spinner = {
        let done = done.clone();
        rt.spawn(async move {
            poll_fn(|cx| {
                if done.load(Ordering::Acquire) {
                    Poll::Ready(())
                } else {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            })
            .await;
        })
    };

    let flag_setter = {
        let done = done.clone();
        rt.spawn(async move {
            done.store(true, Ordering::Release);
        })
    };

    rt.block_on(async move {
        flag_setter.await.unwrap();
        spinner.await.unwrap();
    });

    rt.shutdown();
}

#[test]
fn globally_queued_task_is_not_starved() {
    // Keep a single worker saturated with locally requeueing tasks, then
    // inject a task from outside: the fairness interval must get it polled.
    let _trace = trace_init();
    let mut rt = runtime(1);

    let stop = Arc::new(AtomicBool::new(false));

    let spinners: Vec<_> = (0..4)
        .map(|_| {
            let stop = stop.clone();
            rt.spawn(async move {
                poll_fn(|cx| {
                    if stop.load(Ordering::Acquire) {
                        Poll::Ready(())
                    } else {
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                })
                .await;
            })
        })
        .collect();

    // give the spinners time to occupy the worker
    std::thread::sleep(Duration::from_millis(20));

    // spawned from this (non-worker) thread: lands on the global queue
    let global = {
        let stop = stop.clone();
        rt.spawn(async move {
            stop.store(true, Ordering::Release);
        })
    };

    rt.block_on(async move {
        global.await.unwrap();
        for spinner in spinners {
            spinner.await.unwrap();
        }
    });

    rt.shutdown();
}

#[test]
fn hammered_wakes_are_not_lost() {
    // Many racing wakes from foreign threads: the task must observe a poll
    // after the final wake and complete.
    const THREADS: usize = 4;
    const WAKES_PER_THREAD: usize = 250;

    let _trace = trace_init();
    let mut rt = runtime(2);

    let waker_slot: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
    let hits = Arc::new(AtomicUsize::new(0));

    let handle = {
        let waker_slot = waker_slot.clone();
        let hits = hits.clone();
        rt.spawn(async move {
            poll_fn(move |cx| {
                *waker_slot.lock().unwrap() = Some(cx.waker().clone());
                if hits.load(Ordering::Acquire) >= THREADS * WAKES_PER_THREAD {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
            .await;
        })
    };

    let hammers: Vec<_> = (0..THREADS)
        .map(|_| {
            let waker_slot = waker_slot.clone();
            let hits = hits.clone();
            std::thread::spawn(move || {
                for _ in 0..WAKES_PER_THREAD {
                    // count first, then wake: a poll observing the final
                    // count is guaranteed
                    hits.fetch_add(1, Ordering::Release);
                    if let Some(waker) = waker_slot.lock().unwrap().clone() {
                        waker.wake();
                    }
                }
            })
        })
        .collect();

    for hammer in hammers {
        hammer.join().unwrap();
    }

    // every pre-registration hit was counted; wake once more now that the
    // waker definitely exists
    if let Some(waker) = waker_slot.lock().unwrap().clone() {
        waker.wake();
    }

    rt.block_on(handle).unwrap();
    rt.shutdown();
}

#[test]
fn lifecycle_errors() {
    let _trace = trace_init();

    let mut rt = Builder::new().worker_threads(1).build().unwrap();
    assert!(matches!(
        rt.try_spawn(async {}),
        Err(crate::SpawnError::NotStarted)
    ));

    rt.start();
    let handle = rt.handle().clone();
    rt.block_on(rt.spawn(async { 1 })).unwrap();

    rt.shutdown();
    assert!(matches!(
        handle.try_spawn(async {}),
        Err(crate::SpawnError::Shutdown)
    ));
}

#[test]
fn shutdown_drains_everything() {
    let _trace = trace_init();
    let mut rt = runtime(2);

    // a task parked on I/O that will never complete
    let (_sender, receiver) = mio::unix::pipe::new().expect("failed to create pipe");
    let reactor = rt.handle().reactor().clone();
    let stuck = rt.spawn(async move {
        let op = reactor.submit_read(receiver.as_raw_fd(), None).unwrap();
        let _ = poll_fn(|cx| op.poll_ready(cx)).await;
    });

    // plus a pile of tasks that never get to run
    let idle: Vec<_> = (0..64)
        .map(|_| rt.spawn(future::pending::<()>()))
        .collect();

    std::thread::sleep(Duration::from_millis(20));
    rt.shutdown();

    // nothing is left in flight, and every handle reports a terminal state
    assert_eq!(rt.handle().reactor().in_flight(), 0);
    assert!(stuck.is_finished());
    for handle in &idle {
        assert!(handle.is_finished());
    }
}
