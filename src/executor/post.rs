use crate::executor::Shared;
use crate::task::{AffinitySet, TaskList, TaskRef};

/// Per-worker batches of tasks accumulated during one execution step and
/// flushed together.
///
/// Batching matters for dispatch fan-out: a single issue can produce one
/// child per worker (or more), and flushing once per target worker means one
/// inbox push sequence and one wake each instead of one per child.
pub(crate) struct PostBatch<'a> {
    shared: &'a Shared,
    batches: Vec<TaskList>,
}

impl<'a> PostBatch<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        let batches = std::iter::repeat_with(TaskList::new)
            .take(shared.worker_count())
            .collect();
        Self { shared, batches }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.batches.len()
    }

    /// Picks a randomized starting worker from `affinity` so repeated
    /// dispatches do not all pile onto worker 0. Falls back to worker 0 when
    /// the set excludes everyone; partitioner children always allow any
    /// worker, so this only routes the starting offset.
    pub(crate) fn select_worker(&self, affinity: AffinitySet) -> usize {
        let eligible = affinity.eligible_workers(self.worker_count());
        if eligible.is_empty() {
            0
        } else {
            eligible[fastrand::usize(..eligible.len())]
        }
    }

    pub(crate) fn enqueue(&mut self, worker_index: usize, task: TaskRef) {
        let worker_index = worker_index % self.batches.len();
        self.batches[worker_index].push_back(task);
    }

    /// Flushes every non-empty batch to its worker's inbox and wakes each
    /// target once.
    pub(crate) fn submit(mut self) {
        for (worker_index, batch) in self.batches.iter_mut().enumerate() {
            if !batch.is_empty() {
                self.shared.post_batch_to(worker_index, batch);
            }
        }
    }
}
