use crate::dispatch;
use crate::executor::{PostBatch, Shared};
use crate::task::{self, Submission, TaskFlags, TaskKind, TaskRef};
use crossbeam_deque::Worker as CbWorker;
use parking_lot::{Condvar, Mutex};
use std::iter;
use std::sync::{Arc, Barrier};
use tracing::trace;

/// Mutex-and-flag parker. The flag makes wakeups sticky: an unpark delivered
/// between a worker's last empty queue check and its park is not lost.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Parker {
    pub(crate) fn park(&self) {
        let mut notified = self.notified.lock();
        if !*notified {
            self.condvar.wait(&mut notified);
        }
        *notified = false;
    }

    pub(crate) fn unpark(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.condvar.notify_one();
    }
}

/// One OS thread of the pool, running the ready -> execute -> retire loop.
pub(crate) struct Worker {
    index: usize,
    shared: Arc<Shared>,

    /// Local LIFO deque; other workers steal from its other end.
    local: CbWorker<TaskRef>,

    /// Indices of the other workers, shuffled so each worker's steal search
    /// order is different and contention spreads out.
    steal_order: Vec<usize>,

    /// Scratch buffer lent to whichever tile is currently executing here.
    local_memory: Vec<u8>,
}

impl Worker {
    pub(crate) fn new(
        index: usize,
        shared: Arc<Shared>,
        local: CbWorker<TaskRef>,
        steal_order: Vec<usize>,
    ) -> Self {
        let local_memory = vec![0u8; shared.cfg.worker_local_memory];
        Self {
            index,
            shared,
            local,
            steal_order,
            local_memory,
        }
    }

    pub(crate) fn run(mut self, start_barrier: Arc<Barrier>) {
        start_barrier.wait();

        loop {
            if let Some(task) = self.find_task() {
                self.process(task);
                continue;
            }
            if self.shared.is_shutdown() && self.shared.inflight() == 0 {
                break;
            }
            self.shared.workers[self.index].parker.park();
        }

        trace!(worker = self.index, "worker exiting");
    }

    fn find_task(&self) -> Option<TaskRef> {
        let me = &self.shared.workers[self.index];

        // 1. Drain directed posts into the local deque first; they may carry
        //    affinity constraints that only this worker satisfies.
        if let Some(task) = me.inbox.steal_batch_and_pop(&self.local).success() {
            return Some(task);
        }

        // 2. Local work, then repeatedly try the inbox again and the other
        //    workers' deques.
        self.local.pop().or_else(|| {
            iter::repeat_with(|| {
                me.inbox.steal_batch_and_pop(&self.local).or_else(|| {
                    self.steal_order
                        .iter()
                        .map(|&other| self.shared.workers[other].stealer.steal())
                        .collect()
                })
            })
            .take(crate::tuning::MAX_STEAL_RETRIES)
            .find(|steal| !steal.is_retry())
            .and_then(|steal| steal.success())
        })
    }

    fn process(&mut self, task: TaskRef) {
        // A stolen task may not be allowed here; hand it to a worker its
        // affinity permits.
        if !task.affinity().allows(self.index) {
            self.shared.admit(task);
            self.shared.task_done();
            return;
        }

        // A failed scope or an aborted predecessor discards the task and its
        // downstream instead of executing it.
        if task.has_flag(TaskFlags::ABORTED) || task.scope().is_failed() {
            task::discard_chain(task);
            self.shared.task_done();
            return;
        }

        trace!(worker = self.index, kind = ?task.kind(), "executing task");

        let mut pending_submission = Submission::new();
        match task.kind() {
            TaskKind::Nop | TaskKind::Fence | TaskKind::Wait => {
                task::retire(task, &mut pending_submission, Ok(()));
            }
            TaskKind::Barrier => task::barrier_retire(task, &mut pending_submission),
            TaskKind::Call => task::call_execute(task, &mut pending_submission),
            TaskKind::Dispatch => {
                if task.has_flag(TaskFlags::DISPATCH_RETIRE) {
                    dispatch::dispatch_retire(task, &mut pending_submission);
                } else {
                    let mut post_batch = PostBatch::new(&self.shared);
                    dispatch::issue(
                        task,
                        &self.shared,
                        &mut pending_submission,
                        &mut post_batch,
                    );
                    post_batch.submit();
                }
            }
            TaskKind::DispatchSlice => {
                dispatch::execute_slice(task, &mut self.local_memory, &mut pending_submission);
            }
            TaskKind::DispatchShard => {
                dispatch::execute_shard(task, &mut self.local_memory, &mut pending_submission);
            }
        }

        // Publish side effects before the inflight decrement: anything this
        // task readied is counted before the task itself stops counting, so
        // the quiescence check can never observe a false zero.
        self.publish(pending_submission);
        self.shared.task_done();
    }

    /// Drains the pending submission built during execution: tasks allowed on
    /// this worker go straight onto the local deque (LIFO keeps the freshly
    /// readied dependency chain hot); the rest are routed through the shared
    /// admission path.
    fn publish(&self, mut pending_submission: Submission) {
        if !pending_submission.waiting.is_empty() {
            let mut waits = Submission::new();
            waits.waiting.append(&mut pending_submission.waiting);
            self.shared.admit_submission(waits);
        }

        while let Some(task) = pending_submission.ready.pop_front() {
            if task.affinity().allows(self.index) {
                self.shared.track_enqueued();
                self.local.push(task);
            } else {
                self.shared.admit(task);
            }
        }
    }
}
