use crate::dispatch::DispatchStatistics;
use crate::status::{StatusLatch, TaskError, TaskResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Groups tasks submitted together.
///
/// A scope tracks how many of its tasks are still alive, carries the one
/// permanent failure status for the whole group, and is what submitters wait
/// on for completion. Scopes are cheap; a submitter typically creates one per
/// logical submission and reuses it across retries.
///
/// Only fence, call and dispatch-family tasks hold a scope open; nops,
/// barriers and waits are pure scheduling plumbing and do not count. Use a
/// fence when a submission consists of plumbing only.
pub struct Scope {
    name: String,

    /// Number of live fence/call/dispatch-family tasks bound to this scope.
    /// The scope is idle when this returns to zero.
    outstanding: AtomicU64,

    /// Set at most once; the first non-OK status wins and later failures are
    /// dropped. Once set, tasks in this scope that have not started executing
    /// are discarded instead of executed.
    permanent_status: StatusLatch,

    /// Waiters block here until `outstanding` returns to zero.
    idle_mutex: Mutex<()>,
    idle_condvar: Condvar,

    /// Aggregate statistics merged from every dispatch that retired in this
    /// scope.
    statistics: DispatchStatistics,

    // Lifetime accounting across all task kinds bound to this scope.
    tasks_retired: AtomicU64,
    tasks_discarded: AtomicU64,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Arc<Scope> {
        Arc::new(Scope {
            name: name.into(),
            outstanding: AtomicU64::new(0),
            permanent_status: StatusLatch::new(),
            idle_mutex: Mutex::new(()),
            idle_condvar: Condvar::new(),
            statistics: DispatchStatistics::default(),
            tasks_retired: AtomicU64::new(0),
            tasks_discarded: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Brackets the lifetime of a task that holds the scope open. Paired with
    /// exactly one `end` on the task's terminal path.
    pub(crate) fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn end(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Take the idle mutex so a waiter between its counter check and
            // its condvar wait cannot miss this notification.
            let _guard = self.idle_mutex.lock();
            self.idle_condvar.notify_all();
        }
    }

    /// Latches `err` as the scope's permanent status. If another failure got
    /// there first this one is dropped.
    pub(crate) fn fail(&self, err: TaskError) {
        debug!(scope = %self.name, code = ?err.code(), "scope failed");
        self.permanent_status.fail(err);
    }

    /// Cheap check observed by workers before executing a task: a failed
    /// scope means the task is discarded instead.
    pub fn is_failed(&self) -> bool {
        self.permanent_status.is_set()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }

    /// Blocks until every task bound to this scope has retired or been
    /// discarded, then returns the latched status.
    pub fn wait(&self) -> TaskResult {
        let mut guard = self.idle_mutex.lock();
        while self.outstanding.load(Ordering::Acquire) > 0 {
            self.idle_condvar.wait(&mut guard);
        }
        drop(guard);
        self.latched_status()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// [`TaskError::DeadlineExceeded`]. The scope itself is unaffected;
    /// in-flight tasks keep draining.
    pub fn wait_for(&self, timeout: Duration) -> TaskResult {
        let deadline = Instant::now() + timeout;
        let mut guard = self.idle_mutex.lock();
        while self.outstanding.load(Ordering::Acquire) > 0 {
            if self
                .idle_condvar
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return Err(TaskError::DeadlineExceeded);
            }
        }
        drop(guard);
        self.latched_status()
    }

    fn latched_status(&self) -> TaskResult {
        match self.permanent_status.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn statistics(&self) -> &DispatchStatistics {
        &self.statistics
    }

    pub fn tasks_retired(&self) -> u64 {
        self.tasks_retired.load(Ordering::Relaxed)
    }

    pub fn tasks_discarded(&self) -> u64 {
        self.tasks_discarded.load(Ordering::Relaxed)
    }

    pub(crate) fn record_retired(&self) {
        self.tasks_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.tasks_discarded.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .field("failed", &self.is_failed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;
    use static_assertions::assert_impl_all;
    use std::thread;

    assert_impl_all!(Scope: Send, Sync);

    #[test]
    fn test_wait_returns_immediately_when_idle() {
        let scope = Scope::new("idle");
        assert!(scope.is_idle());
        assert!(scope.wait().is_ok());
        assert!(scope.wait_for(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_wait_blocks_until_end() {
        let scope = Scope::new("blocks");
        scope.begin();
        scope.begin();

        let waiter = {
            let scope = Arc::clone(&scope);
            thread::spawn(move || scope.wait())
        };

        scope.end();
        assert!(!scope.is_idle());
        scope.end();

        assert!(waiter.join().unwrap().is_ok());
        assert!(scope.is_idle());
    }

    #[test]
    fn test_wait_for_times_out() {
        let scope = Scope::new("stuck");
        scope.begin();

        let res = scope.wait_for(Duration::from_millis(10));
        assert!(matches!(res, Err(TaskError::DeadlineExceeded)));

        // The scope is still live and completes normally afterwards.
        scope.end();
        assert!(scope.wait().is_ok());
    }

    #[test]
    fn test_first_failure_wins_and_sticks() {
        let scope = Scope::new("fails");
        scope.begin();

        scope.fail(TaskError::ResourceExhausted("pool empty".into()));
        scope.fail(TaskError::Aborted);
        assert!(scope.is_failed());

        scope.end();
        let err = scope.wait().unwrap_err();
        assert_eq!(err.code(), StatusCode::ResourceExhausted);

        // Waiting again reports the same latched status.
        let err = scope.wait().unwrap_err();
        assert_eq!(err.code(), StatusCode::ResourceExhausted);
    }
}
