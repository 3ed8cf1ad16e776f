//! The worker pool and its embedding surface.
//!
//! An [`Executor`] owns a fixed set of worker threads, two task pools for
//! dispatch children, and the shared admission state. Submitters hand it
//! [`Submission`]s of root tasks and wait on their scopes; everything else
//! happens on the workers.

use crate::scope::Scope;
use crate::status::TaskError;
use crate::task::{self, Submission, TaskList, TaskPool, TaskRef};
use crate::tuning;
use anyhow::{Result, anyhow};
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tracing::debug;

mod post;
pub(crate) use post::PostBatch;

mod worker;
use worker::Worker;
pub(crate) use worker::Parker;


/// Configures and builds an [`Executor`].
#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads.
    ///
    /// Defaults to 1 worker per CPU core, capped at 64 (the width of an
    /// affinity mask).
    worker_threads: Option<usize>,

    /// Bytes of scratch memory each worker owns and lends to executing
    /// tiles. A dispatch requesting more than this fails with resource
    /// exhaustion.
    worker_local_memory: usize,

    /// Prefix for worker thread names; workers are named `{prefix}-{index}`.
    thread_name: String,

    tiles_per_slice: [u32; 3],

    max_tiles_per_shard_reservation: u32,

    pool_block_size: usize,

    /// Optional cap on live records per child pool. The partitioner reacts
    /// to an exhausted pool by fanning out fewer children.
    max_pooled_tasks: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            worker_local_memory: 0,
            thread_name: "workgrid-worker".into(),
            tiles_per_slice: tuning::TILES_PER_SLICE,
            max_tiles_per_shard_reservation: tuning::MAX_TILES_PER_SHARD_RESERVATION,
            pool_block_size: tuning::POOL_BLOCK_SIZE,
            max_pooled_tasks: None,
        }
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    pub fn worker_local_memory(mut self, bytes: usize) -> Self {
        self.worker_local_memory = bytes;
        self
    }

    /// Sets the name prefix of threads spawned by the executor.
    ///
    /// The default prefix is "workgrid-worker".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = val.into();
        self
    }

    /// Overrides the default slice dimensions for sliced dispatches.
    #[track_caller]
    pub fn tiles_per_slice(mut self, val: [u32; 3]) -> Self {
        assert!(
            val.iter().all(|&t| t > 0),
            "tiles_per_slice axes cannot be 0"
        );
        self.tiles_per_slice = val;
        self
    }

    /// Overrides how many tiles a shard reserves per fetch-add at most.
    #[track_caller]
    pub fn max_tiles_per_shard_reservation(mut self, val: u32) -> Self {
        assert!(val > 0, "max_tiles_per_shard_reservation cannot be 0");
        self.max_tiles_per_shard_reservation = val;
        self
    }

    #[track_caller]
    pub fn pool_block_size(mut self, val: usize) -> Self {
        assert!(val > 0, "pool_block_size cannot be 0");
        self.pool_block_size = val;
        self
    }

    pub fn max_pooled_tasks(mut self, val: usize) -> Self {
        self.max_pooled_tasks = Some(val);
        self
    }

    /// Creates the configured [`Executor`] and spawns its workers. The
    /// returned executor is ready to accept submissions.
    pub fn try_build(self) -> Result<Executor> {
        let cfg: ExecutorConfig = self.try_into()?;
        let worker_count = cfg.worker_threads;

        // Create the local deques up front so each WorkerShared can hold the
        // matching stealer.
        let mut local_queues = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let local = CbWorker::new_lifo();
            workers.push(WorkerShared {
                inbox: Injector::new(),
                stealer: local.stealer(),
                parker: Parker::default(),
            });
            local_queues.push(local);
        }

        let new_pool = || match cfg.max_pooled_tasks {
            Some(max_tasks) => TaskPool::with_max_tasks(cfg.pool_block_size, max_tasks),
            None => TaskPool::new(cfg.pool_block_size),
        };
        let slice_pool = new_pool();
        let shard_pool = new_pool();

        let shared = Arc::new(Shared {
            slice_pool,
            shard_pool,
            workers,
            waiting: Mutex::new(TaskList::new()),
            inflight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            next_worker: AtomicUsize::new(0),
            cfg,
        });

        let start_barrier = Arc::new(Barrier::new(worker_count + 1));
        let mut handles = Vec::with_capacity(worker_count);
        for (index, local) in local_queues.into_iter().enumerate() {
            // Give each worker a shuffled view of the others so steal probes
            // do not all hit the same victim.
            let mut steal_order: Vec<usize> =
                (0..worker_count).filter(|&other| other != index).collect();
            fastrand::shuffle(&mut steal_order);

            let worker = Worker::new(index, Arc::clone(&shared), local, steal_order);
            let start_barrier = Arc::clone(&start_barrier);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", shared.cfg.thread_name, index))
                .spawn(move || worker.run(start_barrier))?;
            handles.push(handle);
        }

        // Spawning threads is async; wait until every worker is up.
        start_barrier.wait();

        debug!(
            worker_count,
            local_memory = shared.cfg.worker_local_memory,
            "executor started"
        );

        Ok(Executor {
            shared,
            handles: Mutex::new(handles),
        })
    }
}

// Validated builder output, consumed by the shared state and the workers.
#[derive(Debug)]
pub(crate) struct ExecutorConfig {
    pub(crate) worker_threads: usize,
    pub(crate) worker_local_memory: usize,
    pub(crate) thread_name: String,
    pub(crate) tiles_per_slice: [u32; 3],
    pub(crate) max_tiles_per_shard_reservation: u32,
    pub(crate) pool_block_size: usize,
    pub(crate) max_pooled_tasks: Option<usize>,
}

impl TryFrom<Builder> for ExecutorConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        let worker_threads = match builder.worker_threads {
            Some(val) => val,
            None => thread::available_parallelism()?.get().min(64),
        };
        if worker_threads > 64 {
            return Err(anyhow!(
                "worker_threads must be at most 64 (affinity masks are 64 bits wide), got {}",
                worker_threads
            ));
        }

        Ok(ExecutorConfig {
            worker_threads,
            worker_local_memory: builder.worker_local_memory,
            thread_name: builder.thread_name,
            tiles_per_slice: builder.tiles_per_slice,
            max_tiles_per_shard_reservation: builder.max_tiles_per_shard_reservation,
            pool_block_size: builder.pool_block_size,
            max_pooled_tasks: builder.max_pooled_tasks,
        })
    }
}

/// Per-worker state visible to every thread: the directed-post inbox, the
/// steal handle onto the worker's deque, and its parker.
pub(crate) struct WorkerShared {
    pub(crate) inbox: Injector<TaskRef>,
    pub(crate) stealer: Stealer<TaskRef>,
    pub(crate) parker: Parker,
}

/// State shared between the executor handle and every worker.
pub(crate) struct Shared {
    pub(crate) cfg: ExecutorConfig,
    pub(crate) workers: Vec<WorkerShared>,
    pub(crate) slice_pool: Arc<TaskPool>,
    pub(crate) shard_pool: Arc<TaskPool>,

    /// Wait tasks whose condition has not reported completed yet; rechecked
    /// on every admission.
    waiting: Mutex<TaskList>,

    /// Tasks currently enqueued or executing, executor-wide. Incremented
    /// before a task reaches any queue and decremented only after the task's
    /// side effects are published, so zero really means quiescent.
    inflight: AtomicUsize,

    shutdown: AtomicBool,

    /// Round-robin cursor for admission routing.
    next_worker: AtomicUsize,
}

impl Shared {
    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub(crate) fn track_enqueued(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks one popped task fully processed. The final decrement during
    /// shutdown wakes everyone so the pool can exit.
    pub(crate) fn task_done(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 && self.is_shutdown() {
            self.unpark_all();
        }
    }

    pub(crate) fn unpark_all(&self) {
        for worker in &self.workers {
            worker.parker.unpark();
        }
    }

    /// Routes one ready task to a worker its affinity permits, round-robin.
    ///
    /// An affinity set that excludes every worker fails the scope with
    /// `InvalidArgument` and discards the task and its downstream.
    pub(crate) fn admit(&self, task: TaskRef) {
        let eligible = task.affinity().eligible_workers(self.worker_count());
        if eligible.is_empty() {
            task.scope().fail(TaskError::InvalidArgument(
                "task affinity excludes every worker".into(),
            ));
            task::discard_chain(task);
            return;
        }

        let cursor = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let worker_index = eligible[cursor % eligible.len()];
        self.track_enqueued();
        self.workers[worker_index].inbox.push(task);
        self.workers[worker_index].parker.unpark();
    }

    /// Admits a whole submission: satisfied waits join the ready list, the
    /// rest park on the shared waiting list for the next recheck.
    pub(crate) fn admit_submission(&self, mut submission: Submission) {
        {
            let mut waiting = self.waiting.lock();
            waiting.append(&mut submission.waiting);

            let mut parked = TaskList::new();
            while let Some(wait_task) = waiting.pop_front() {
                if task::wait_check_condition(&wait_task) {
                    submission.ready.push_back(wait_task);
                } else {
                    parked.push_back(wait_task);
                }
            }
            waiting.append(&mut parked);
        }

        while let Some(task) = submission.ready.pop_front() {
            self.admit(task);
        }
    }

    /// Flushes one post batch into a worker's inbox with a single wake.
    pub(crate) fn post_batch_to(&self, worker_index: usize, batch: &mut TaskList) {
        let worker = &self.workers[worker_index];
        while let Some(task) = batch.pop_front() {
            self.track_enqueued();
            worker.inbox.push(task);
        }
        worker.parker.unpark();
    }
}

/// A fixed pool of worker threads executing task DAGs.
///
/// Dropping the executor waits for quiescence: every admitted task runs (or
/// is discarded) before the threads are joined.
pub struct Executor {
    shared: Arc<Shared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Executor {
    /// Creates an executor with `worker_count` workers, each owning
    /// `worker_local_memory` bytes of tile scratch.
    pub fn create(worker_count: usize, worker_local_memory: usize) -> Result<Executor> {
        Self::builder()
            .worker_threads(worker_count)
            .worker_local_memory(worker_local_memory)
            .try_build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    /// Admits a batch of root tasks. Non-blocking: routing happens here, all
    /// execution happens on the workers.
    ///
    /// After shutdown every submitted task is discarded and `Aborted` is
    /// returned.
    pub fn submit(&self, mut submission: Submission) -> Result<(), TaskError> {
        if self.shared.is_shutdown() {
            submission.ready.discard_all();
            submission.waiting.discard_all();
            return Err(TaskError::Aborted);
        }
        self.shared.admit_submission(submission);
        Ok(())
    }

    /// Releases pooled free records back to the allocator. Safe to call at
    /// any time; records in use are unaffected and the pools regrow on
    /// demand.
    pub fn trim(&self) {
        self.shared.slice_pool.trim();
        self.shared.shard_pool.trim();
    }

    /// Stops accepting work, waits for everything in flight to drain and
    /// joins the workers. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("executor shutting down");

        // Parked waits can never become ready once the executor stops.
        self.shared.waiting.lock().discard_all();

        self.shared.unpark_all();
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("worker_count", &self.worker_count())
            .field("inflight", &self.shared.inflight())
            .field("shutdown", &self.shared.is_shutdown())
            .finish()
    }
}

/// Convenience for the common single-scope pattern: submit and wait.
impl Executor {
    /// Submits `submission` and blocks until `scope` goes idle, returning the
    /// scope's latched status.
    pub fn submit_and_wait(
        &self,
        submission: Submission,
        scope: &Arc<Scope>,
    ) -> Result<(), TaskError> {
        self.submit(submission)?;
        scope.wait()
    }
}
