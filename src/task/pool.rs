use crate::status::TaskError;
use crate::task::{Task, TaskRef};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Free-list allocator for short-lived task records.
///
/// Dispatches fan out into hundreds of slice/shard children per issue; the
/// pool keeps those records out of the allocator's way by recycling them.
/// A released record keeps its heap allocation and is rewritten in place the
/// next time it is acquired, which is safe exactly because the free list
/// holds the only handle to it by then.
///
/// `max_tasks` bounds the total number of live records; acquiring past the
/// bound reports `ResourceExhausted` rather than growing. The partitioner
/// reacts by fanning out fewer children, so exhaustion degrades throughput
/// instead of failing dispatches outright.
pub struct TaskPool {
    /// Capacity reservation granularity for the free list.
    block_size: usize,

    /// Records currently live (acquired or on the free list).
    allocated: AtomicUsize,

    max_tasks: Option<usize>,

    free: Mutex<Vec<TaskRef>>,
}

impl TaskPool {
    #[track_caller]
    pub fn new(block_size: usize) -> Arc<TaskPool> {
        assert!(block_size > 0, "block_size cannot be 0");
        Arc::new(TaskPool {
            block_size,
            allocated: AtomicUsize::new(0),
            max_tasks: None,
            free: Mutex::new(Vec::with_capacity(block_size)),
        })
    }

    #[track_caller]
    pub fn with_max_tasks(block_size: usize, max_tasks: usize) -> Arc<TaskPool> {
        assert!(block_size > 0, "block_size cannot be 0");
        Arc::new(TaskPool {
            block_size,
            allocated: AtomicUsize::new(0),
            max_tasks: Some(max_tasks),
            free: Mutex::new(Vec::with_capacity(block_size.min(max_tasks))),
        })
    }

    /// Acquires a record initialized by `make`, recycling a free record when
    /// one is available.
    pub(crate) fn acquire_with(
        self: &Arc<Self>,
        make: impl FnOnce() -> Task,
    ) -> Result<TaskRef, TaskError> {
        if let Some(mut recycled) = self.pop_recycled() {
            let record = Arc::get_mut(&mut recycled).expect("recycled record uniquely owned");
            // Rewrite the record in place; the old task was fully retired
            // before its record landed on the free list.
            *record = make();
            recycled.set_pool(self);
            return Ok(recycled);
        }

        let next = self.allocated.fetch_add(1, Ordering::Relaxed);
        if let Some(max_tasks) = self.max_tasks
            && next >= max_tasks
        {
            self.allocated.fetch_sub(1, Ordering::Relaxed);
            return Err(TaskError::ResourceExhausted(format!(
                "task pool exhausted ({max_tasks} records)"
            )));
        }

        let task = Arc::new(make());
        task.set_pool(self);
        Ok(task)
    }

    /// Returns a retired record to the free list. The record's pool link was
    /// already cleared by cleanup; holding it here must not form a cycle back
    /// through the pool.
    pub(crate) fn release(&self, task: TaskRef) {
        let mut free = self.free.lock();
        if free.capacity() == free.len() {
            free.reserve(self.block_size);
        }
        free.push(task);
    }

    /// Drops every free record, returning their memory to the allocator.
    /// Records currently acquired are unaffected.
    pub fn trim(&self) {
        let mut free = self.free.lock();
        self.allocated.fetch_sub(free.len(), Ordering::Relaxed);
        free.clear();
        free.shrink_to(self.block_size);
    }

    /// Number of records currently live (acquired or free).
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Pops a free record that nothing else still references. A record whose
    /// releasing worker has not dropped its handle yet is skipped; it becomes
    /// recyclable on a later acquire.
    fn pop_recycled(&self) -> Option<TaskRef> {
        let mut free = self.free.lock();
        let mut index = free.len();
        while index > 0 {
            index -= 1;
            if Arc::strong_count(&free[index]) == 1 {
                return Some(free.swap_remove(index));
            }
        }
        None
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("allocated", &self.allocated())
            .field("free", &self.free_count())
            .field("max_tasks", &self.max_tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use crate::status::StatusCode;
    use crate::task::{Body, Submission, retire};
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskPool: Send, Sync);

    fn acquire_nop(pool: &Arc<TaskPool>, scope: &Arc<Scope>) -> Result<TaskRef, TaskError> {
        let scope = Arc::clone(scope);
        pool.acquire_with(move || Task::from_body(&scope, Body::Nop))
    }

    #[test]
    fn test_retired_records_recycle() {
        let pool = TaskPool::new(4);
        let scope = Scope::new("pool");

        let task = acquire_nop(&pool, &scope).unwrap();
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.free_count(), 0);

        let mut pending = Submission::new();
        retire(task, &mut pending, Ok(()));
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.free_count(), 1);

        // The next acquire reuses the record instead of growing the pool.
        let again = acquire_nop(&pool, &scope).unwrap();
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.free_count(), 0);
        drop(again);
    }

    #[test]
    fn test_exhaustion_reports_resource_exhausted() {
        let pool = TaskPool::with_max_tasks(2, 2);
        let scope = Scope::new("exhausted");

        let a = acquire_nop(&pool, &scope).unwrap();
        let _b = acquire_nop(&pool, &scope).unwrap();

        let err = acquire_nop(&pool, &scope).unwrap_err();
        assert_eq!(err.code(), StatusCode::ResourceExhausted);

        // Releasing a record makes the pool usable again.
        let mut pending = Submission::new();
        retire(a, &mut pending, Ok(()));
        assert!(acquire_nop(&pool, &scope).is_ok());
    }

    #[test]
    fn test_cleanup_returns_record_to_pool() {
        let pool = TaskPool::new(4);
        let scope = Scope::new("cleanup");

        let task = acquire_nop(&pool, &scope).unwrap();
        let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let cleaned = Arc::clone(&cleaned);
            task.set_cleanup_fn(move |code| {
                assert_eq!(code, StatusCode::Ok);
                cleaned.store(true, Ordering::Relaxed);
            });
        }

        let mut pending = Submission::new();
        retire(task, &mut pending, Ok(()));

        assert!(cleaned.load(Ordering::Relaxed));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_trim_drops_free_records() {
        let pool = TaskPool::new(4);
        let scope = Scope::new("trim");

        let mut pending = Submission::new();
        for _ in 0..3 {
            let task = acquire_nop(&pool, &scope).unwrap();
            retire(task, &mut pending, Ok(()));
        }
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.allocated(), 3);

        pool.trim();
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.allocated(), 0);

        // The pool keeps working after a trim.
        assert!(acquire_nop(&pool, &scope).is_ok());
    }
}
