// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime facade: configuration, lifecycle, spawning and `block_on`.
//!
//! A [`Runtime`] owns a set of worker threads (each driving one scheduler
//! core) plus one reactor thread. [`Builder`] configures it, [`Handle`] is
//! the cheaply-cloneable face everything else talks to; it is also what a
//! task's waker holds, placing woken tasks into the right run queue.

pub(crate) mod context;
pub(crate) mod coop;
mod worker;

use crate::error::{NoRuntime, SpawnError};
use crate::park::{Parker, ParkingLot, StdPark};
use crate::reactor;
use crate::scheduler::injector::{Injector, TryStealError};
use crate::scheduler::{queue, Core, Schedule};
use crate::task::{JoinHandle, TaskBuilder, TaskRef};
use crate::util::Backoff;
use core::fmt;
use core::future::Future;
use core::pin::pin;
use core::task::{Context, Poll};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use worker::Worker;

use static_assertions::assert_impl_all;

/// Environment variable overriding the auto-detected worker thread count.
/// Advisory: an explicit [`Builder::worker_threads`] wins.
const ENV_WORKER_THREADS: &str = "CORVID_WORKER_THREADS";

// lifecycle states
const NEW: u8 = 0;
const RUNNING: u8 = 1;
const SHUTDOWN: u8 = 2;

/// Spawn a future onto the runtime whose context is installed on the calling
/// thread (a worker thread, or a thread inside [`Runtime::block_on`]).
///
/// # Errors
///
/// Returns [`SpawnError::NotStarted`] when the calling thread has no runtime
/// context, and propagates the runtime's own spawn errors otherwise.
#[track_caller]
pub fn spawn<F>(future: F) -> Result<JoinHandle<F::Output>, SpawnError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let Some(handle) = context::try_current() else {
        return Err(SpawnError::NotStarted);
    };
    handle.try_spawn(future)
}

/// The index of the runtime worker running on the calling thread, or `None`
/// when called from outside a worker.
pub fn current_worker_id() -> Option<usize> {
    context::current_worker_id()
}

/// The id of the task currently being polled on the calling thread, if any.
pub fn current_task_id() -> Option<crate::task::Id> {
    context::current_task()
}

/// Configures and builds a [`Runtime`].
#[derive(Debug, Clone)]
pub struct Builder {
    worker_threads: Option<usize>,
    queue_capacity: usize,
    enable_work_stealing: bool,
    enable_lifo_slot: bool,
    steal_batch_size: Option<usize>,
    global_poll_interval: u32,
    spin_before_park: u32,
    reactor_backend: reactor::Backend,
    reactor_queue_depth: usize,
}

/// The resolved configuration a runtime was built with.
#[derive(Debug)]
pub(crate) struct Config {
    pub(crate) worker_threads: usize,
    pub(crate) enable_work_stealing: bool,
    pub(crate) steal_batch_size: usize,
    pub(crate) global_poll_interval: u32,
    pub(crate) spin_before_park: u32,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            queue_capacity: 256,
            enable_work_stealing: true,
            enable_lifo_slot: true,
            steal_batch_size: None,
            global_poll_interval: 61,
            spin_before_park: 64,
            reactor_backend: reactor::Backend::Auto,
            reactor_queue_depth: 1024,
        }
    }

    /// The number of worker threads. Defaults to the number of CPUs
    /// (overridable through the `CORVID_WORKER_THREADS` environment
    /// variable).
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count.max(1));
        self
    }

    /// Capacity of each worker's local run queue. Must be a power of two.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "queue capacity must be a power of two"
        );
        self.queue_capacity = capacity;
        self
    }

    /// Whether idle workers steal from their siblings. On by default.
    pub fn enable_work_stealing(mut self, enabled: bool) -> Self {
        self.enable_work_stealing = enabled;
        self
    }

    /// Whether each worker keeps a one-element LIFO slot for tasks woken from
    /// the same worker. On by default.
    pub fn enable_lifo_slot(mut self, enabled: bool) -> Self {
        self.enable_lifo_slot = enabled;
        self
    }

    /// The maximum number of tasks moved per batch steal. Defaults to half
    /// the queue capacity.
    pub fn steal_batch_size(mut self, batch: usize) -> Self {
        self.steal_batch_size = Some(batch.max(1));
        self
    }

    /// Check the global injection queue first every N scheduling decisions,
    /// bounding how long a globally queued task can be overtaken by local
    /// work.
    pub fn global_poll_interval(mut self, interval: u32) -> Self {
        self.global_poll_interval = interval.max(1);
        self
    }

    /// How many pause-loop iterations a worker spins before parking, to
    /// absorb micro-bursts without a sleep/wake round trip.
    pub fn spin_before_park(mut self, spins: u32) -> Self {
        self.spin_before_park = spins;
        self
    }

    /// The maximum number of in-flight reactor operations.
    pub fn reactor_queue_depth(mut self, depth: usize) -> Self {
        self.reactor_queue_depth = depth.max(1);
        self
    }

    /// Pin the reactor to a named backend instead of the platform default.
    /// Building fails when the named backend does not exist on the target.
    pub fn reactor_backend(mut self, backend: reactor::Backend) -> Self {
        self.reactor_backend = backend;
        self
    }

    /// Build the runtime. Workers and the reactor thread are not started
    /// until [`Runtime::start`].
    ///
    /// # Errors
    ///
    /// Returns an error when the OS refuses the reactor's backend resources.
    pub fn build(self) -> io::Result<Runtime> {
        let worker_threads = self
            .worker_threads
            .or_else(worker_threads_from_env)
            .unwrap_or_else(default_worker_threads);

        let config = Config {
            worker_threads,
            enable_work_stealing: self.enable_work_stealing,
            steal_batch_size: self
                .steal_batch_size
                .unwrap_or_else(|| (self.queue_capacity / 2).max(1)),
            global_poll_interval: self.global_poll_interval,
            spin_before_park: self.spin_before_park,
        };

        let mut remotes = Vec::with_capacity(worker_threads);
        let mut cores = Vec::with_capacity(worker_threads);
        for index in 0..worker_threads {
            let (steal, local) = queue::local(self.queue_capacity);
            remotes.push(Remote { steal });
            cores.push(Box::new(Core::new(index, local, self.enable_lifo_slot)));
        }

        self.reactor_backend.check()?;
        let (driver, reactor) = reactor::new(self.reactor_queue_depth)?;

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            remotes: remotes.into_boxed_slice(),
            parking_lot: ParkingLot::with_capacity(worker_threads),
            num_searching: AtomicUsize::new(0),
            owned: Mutex::new(HashMap::new()),
            lifecycle: AtomicU8::new(NEW),
            reactor,
            config,
        });

        Ok(Runtime {
            handle: Handle { shared },
            cores,
            driver: Some(driver),
            workers: Vec::with_capacity(worker_threads),
            driver_thread: None,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_threads_from_env() -> Option<usize> {
    let value = std::env::var(ENV_WORKER_THREADS).ok()?;
    match value.parse::<usize>() {
        Ok(count) if count > 0 => Some(count),
        _ => {
            tracing::warn!(
                %value,
                "ignoring unparseable {ENV_WORKER_THREADS} environment variable"
            );
            None
        }
    }
}

fn default_worker_threads() -> usize {
    thread::available_parallelism().map_or(1, |count| count.get())
}

/// State shared between the runtime facade, its workers, its reactor and
/// every task's waker.
pub(crate) struct Shared {
    pub(crate) injector: Injector,
    pub(crate) remotes: Box<[Remote]>,
    pub(crate) parking_lot: ParkingLot<StdPark>,
    /// Number of workers currently searching for work to steal; used to
    /// throttle stealing to at most half the awake workers.
    pub(crate) num_searching: AtomicUsize,
    /// Every live task, keyed by id. Tasks suspended in `AwaitingWake` sit in
    /// no run queue, so shutdown cancels the stragglers through this
    /// registry; workers remove entries as tasks complete.
    pub(crate) owned: Mutex<HashMap<u64, TaskRef>>,
    lifecycle: AtomicU8,
    pub(crate) reactor: reactor::Handle,
    pub(crate) config: Config,
}

/// The remotely accessible half of one worker.
pub(crate) struct Remote {
    pub(crate) steal: queue::Steal,
}

impl Shared {
    fn lifecycle(&self) -> u8 {
        self.lifecycle.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lifecycle() == RUNNING
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.lifecycle() == SHUTDOWN
    }

    fn transition_running(&self) -> bool {
        self.lifecycle
            .compare_exchange(NEW, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn transition_shutdown(&self) -> bool {
        self.lifecycle.swap(SHUTDOWN, Ordering::AcqRel) != SHUTDOWN
    }

    /// Forget a task that ran to completion.
    pub(crate) fn release_task(&self, task: &TaskRef) {
        self.owned.lock().unwrap().remove(&task.id().as_u64());
    }
}

/// A cheaply-cloneable handle to a [`Runtime`].
///
/// Handles can spawn tasks, reach the reactor, and outlive the `Runtime`
/// value itself (operations on a shut-down runtime return errors).
#[derive(Clone)]
pub struct Handle {
    pub(crate) shared: Arc<Shared>,
}

assert_impl_all!(Handle: Send, Sync);

impl Handle {
    /// The handle of the runtime whose context is installed on the calling
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns [`NoRuntime`] when called from a thread without a runtime
    /// context (neither a worker thread nor inside `block_on`).
    pub fn try_current() -> Result<Handle, NoRuntime> {
        context::try_current().ok_or(NoRuntime(()))
    }

    /// Like [`try_current`](Self::try_current), but panics without a context.
    #[track_caller]
    pub fn current() -> Handle {
        match Self::try_current() {
            Ok(handle) => handle,
            Err(error) => panic!("{error}"),
        }
    }

    /// Attempt to spawn a future onto this runtime.
    ///
    /// The returned [`JoinHandle`] can be used to await the future's output
    /// as well as to control some aspects of its runtime behaviour (such as
    /// aborting it). Dropping the handle detaches the task.
    ///
    /// # Errors
    ///
    /// Fails when the runtime has not been started yet or is shutting down.
    #[track_caller]
    pub fn try_spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.shared.lifecycle() {
            NEW => return Err(SpawnError::NotStarted),
            SHUTDOWN => return Err(SpawnError::Shutdown),
            _ => {}
        }

        let (task, join) = TaskBuilder::new(self.clone()).build(future);
        self.shared
            .owned
            .lock()
            .unwrap()
            .insert(task.id().as_u64(), task.clone());
        self.schedule_spawned(task);
        Ok(join)
    }

    /// Spawn a future onto this runtime.
    ///
    /// # Panics
    ///
    /// Panics when the runtime cannot accept tasks; see
    /// [`try_spawn`](Self::try_spawn) for the fallible version.
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.try_spawn(future) {
            Ok(join) => join,
            Err(error) => panic!("cannot spawn task: {error}"),
        }
    }

    /// The reactor handle, for I/O primitives built on top of this runtime.
    pub fn reactor(&self) -> &reactor::Handle {
        &self.shared.reactor
    }

    /// First placement of a freshly spawned task: the back of the local queue
    /// when spawned from one of this runtime's workers, the injector
    /// otherwise.
    fn schedule_spawned(&self, task: TaskRef) {
        let remaining = context::with_worker(|ctx| match ctx {
            Some(worker) if worker.belongs_to(&self.shared) => {
                tracing::trace!(?task, "spawning locally");
                worker
                    .core()
                    .push_back_or_overflow(task, &self.shared.injector);
                None
            }
            _ => Some(task),
        });

        if let Some(task) = remaining {
            tracing::trace!(?task, "spawning remote");
            self.shared.injector.push(task);
        }

        self.shared.parking_lot.unpark_one();
    }
}

impl Schedule for Handle {
    /// Wake placement: the LIFO slot of the current worker when the wake
    /// happens on a worker of this runtime, the injector otherwise; either
    /// way one parked worker is unparked.
    fn schedule(&self, task: TaskRef) {
        let remaining = context::with_worker(|ctx| match ctx {
            Some(worker) if worker.belongs_to(&self.shared) => {
                worker.core().schedule_woken(task, &self.shared.injector);
                None
            }
            _ => Some(task),
        });

        if let Some(task) = remaining {
            self.shared.injector.push(task);
        }

        self.shared.parking_lot.unpark_one();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("workers", &self.shared.config.worker_threads)
            .field("lifecycle", &self.shared.lifecycle())
            .finish_non_exhaustive()
    }
}

/// A multi-threaded, work-stealing runtime.
///
/// See the [crate docs](crate) for an overview and an example.
pub struct Runtime {
    handle: Handle,
    /// Worker cores, moved into their threads by [`start`](Self::start).
    cores: Vec<Box<Core>>,
    /// The reactor driver, moved into its thread by [`start`](Self::start).
    driver: Option<reactor::Driver>,
    workers: Vec<thread::JoinHandle<()>>,
    driver_thread: Option<thread::JoinHandle<()>>,
}

impl Runtime {
    /// Build a runtime with default configuration. See [`Builder`] for the
    /// knobs.
    ///
    /// # Errors
    ///
    /// Returns an error when the OS refuses the reactor's backend resources.
    pub fn new() -> io::Result<Self> {
        Builder::new().build()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Start the worker threads and the reactor thread. Does nothing if the
    /// runtime is already started (or shut down).
    pub fn start(&mut self) {
        if !self.handle.shared.transition_running() {
            return;
        }

        let driver = self
            .driver
            .take()
            .expect("reactor driver present until first start");
        self.driver_thread = Some(
            thread::Builder::new()
                .name("corvid-reactor".into())
                .spawn(move || driver.run())
                .expect("failed to spawn reactor thread"),
        );

        for core in self.cores.drain(..) {
            let index = core.index();
            let worker = Worker::new(self.handle.shared.clone(), core);
            self.workers.push(
                thread::Builder::new()
                    .name(format!("corvid-worker-{index}"))
                    .spawn(move || worker.run())
                    .expect("failed to spawn worker thread"),
            );
        }

        tracing::debug!(
            workers = self.workers.len(),
            "runtime started"
        );
    }

    /// See [`Handle::try_spawn`].
    #[track_caller]
    pub fn try_spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.try_spawn(future)
    }

    /// See [`Handle::spawn`].
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Drive `future` to completion on the calling thread.
    ///
    /// The calling thread installs the runtime context (so `spawn`, `sleep`
    /// etc. work inside), polls the future, and parks between polls; the
    /// future's waker unparks it. All spawned tasks run on the worker
    /// threads.
    ///
    /// # Panics
    ///
    /// Panics when the runtime has not been [`start`](Self::start)ed.
    #[track_caller]
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        assert!(
            self.handle.shared.is_running(),
            "block_on requires a started runtime (call `Runtime::start` first)"
        );

        let _ctx = context::enter(self.handle.clone());
        let _span = tracing::debug_span!("block_on").entered();

        let parker = Parker::new(StdPark::new());
        let waker = parker.clone().into_unpark().into_waker();
        let mut cx = Context::from_waker(&waker);

        let mut future = pin!(future);

        loop {
            coop::reset();
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }

            tracing::trace!("block_on: parking");
            parker.park();
        }
    }

    /// Signal shutdown without waiting: no new tasks are accepted and
    /// workers exit after draining their queues. Use
    /// [`shutdown`](Self::shutdown) to also wait for them.
    pub fn stop(&self) {
        if self.handle.shared.transition_shutdown() {
            tracing::debug!("stop signal");
            self.handle.shared.parking_lot.unpark_all();
        }
    }

    /// Shut the runtime down: stop accepting tasks, cancel everything still
    /// queued or waiting on I/O, and join all threads.
    ///
    /// Every outstanding task ends Completed or Cancelled, every in-flight
    /// reactor operation is cancelled and its completion bridge freed.
    pub fn shutdown(&mut self) {
        self.stop();

        for thread in self.workers.drain(..) {
            let _ = thread.join();
        }

        // failing the outstanding ops wakes their tasks; with the workers
        // gone those wakes all land in the injector
        self.handle.shared.reactor.close();
        if let Some(thread) = self.driver_thread.take() {
            let _ = thread.join();
        }

        self.drain_injector();

        // cores that were never started still hold their initial tasks
        for core in self.cores.drain(..) {
            core.shutdown();
        }

        // finally, cancel the stragglers: tasks suspended in AwaitingWake
        // live in no queue at all, only in the owned-task registry
        let stragglers: Vec<TaskRef> = {
            let mut owned = self.handle.shared.owned.lock().unwrap();
            owned.drain().map(|(_, task)| task).collect()
        };
        for task in stragglers {
            task.shutdown();
        }

        tracing::debug!("runtime shut down");
    }

    fn drain_injector(&self) {
        let mut backoff = Backoff::new();
        loop {
            match self.handle.shared.injector.try_steal() {
                Ok(stealer) => {
                    while let Some(task) = stealer.pop_one() {
                        task.shutdown();
                    }
                }
                Err(TryStealError::Empty) => break,
                Err(TryStealError::Busy) => backoff.spin(),
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("handle", &self.handle)
            .field("running_workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}
