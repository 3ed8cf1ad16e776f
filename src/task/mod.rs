//! Task records and their lifecycle.
//!
//! A task is a reference-counted record: a common header (flags, scope,
//! affinity, dependency counter, completion edge) plus a kind-specific body.
//! The dependency graph is strictly forward: predecessors hold handles to
//! their successors, never the other way around, so there are no ownership
//! cycles to break.
//!
//! Lifecycle: records are created by a submitter, wired into the graph with
//! [`Task::set_completion_task`] or barrier edges, executed by exactly one
//! worker once their dependency count returns to zero, and destroyed on one
//! of two terminal paths: [`retire`] (normal completion, dependents readied)
//! or [`discard`] (scope failed or a predecessor aborted, dependents walked
//! and discarded too). Cleanup runs exactly once on either path.

use crate::dispatch::{DispatchBody, ShardBody, SliceBody};
use crate::scope::Scope;
use crate::status::{StatusCode, StatusLatch, TaskResult};
use crate::tuning::SPILL_TO_HEAP_THRESHOLD;
use bitflags::bitflags;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub mod list;
pub use list::{Submission, TaskList};

pub mod pool;
pub use pool::TaskPool;

/// Shared handle to a task record.
pub type TaskRef = Arc<Task>;

/// Closure executed by a call task. Receives the worker-local pending
/// submission so it can enqueue follow-on tasks, including ones that keep the
/// call itself alive as their completion target.
pub type CallFn = dyn Fn(&mut Submission) -> TaskResult + Send + Sync;

pub(crate) type CleanupFn = Box<dyn FnOnce(StatusCode) + Send>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// The task must not execute; its final decrement discards it.
        const ABORTED = 1 << 0;

        /// The wait condition reported completed.
        const WAIT_COMPLETED = 1 << 1;

        /// The dispatch reads its workgroup count from a buffer at issue
        /// time instead of carrying a literal.
        const DISPATCH_INDIRECT = 1 << 2;

        /// The dispatch has fanned out; the next time it is picked up it
        /// retires instead of issuing again.
        const DISPATCH_RETIRE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Nop,
    Call,
    Barrier,
    Fence,
    Wait,
    Dispatch,
    DispatchSlice,
    DispatchShard,
}

/// Bitmask over worker indices a task may execute on. Workers are numbered
/// from zero; the mask is 64 bits wide, which also caps the pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinitySet(pub(crate) u64);

impl AffinitySet {
    pub const fn any() -> Self {
        Self(u64::MAX)
    }

    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn worker(index: usize) -> Self {
        Self(1u64 << (index % 64))
    }

    #[must_use]
    pub const fn with_worker(self, index: usize) -> Self {
        Self(self.0 | 1u64 << (index % 64))
    }

    pub(crate) fn allows(self, index: usize) -> bool {
        self.0 & (1u64 << (index % 64)) != 0
    }

    /// Worker indices below `worker_count` this set permits.
    pub(crate) fn eligible_workers(
        self,
        worker_count: usize,
    ) -> SmallVec<[usize; SPILL_TO_HEAP_THRESHOLD]> {
        (0..worker_count.min(64)).filter(|&i| self.allows(i)).collect()
    }
}

/// Opaque token naming the external signal a wait task parks on.
///
/// Condition polling is not wired to an OS primitive; wait handles currently
/// report completed as soon as they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitHandle(u64);

impl WaitHandle {
    pub fn new(token: u64) -> Self {
        Self(token)
    }

    pub fn token(&self) -> u64 {
        self.0
    }
}

pub(crate) struct CallBody {
    pub(crate) closure: Box<CallFn>,

    /// Deferred failure slot. A closure failure is stashed here because
    /// pending dependencies may keep the task alive past this execution; the
    /// status must survive until the task can actually retire.
    pub(crate) status: StatusLatch,
}

pub(crate) struct BarrierBody {
    pub(crate) dependent_tasks: Mutex<Vec<TaskRef>>,
}

pub(crate) struct WaitBody {
    #[allow(dead_code)]
    pub(crate) handle: WaitHandle,
}

pub(crate) enum Body {
    Nop,
    Call(CallBody),
    Barrier(BarrierBody),
    Fence,
    Wait(WaitBody),
    Dispatch(DispatchBody),
    DispatchSlice(SliceBody),
    DispatchShard(ShardBody),
}

pub struct Task {
    pub(crate) body: Body,
    pub(crate) flags: AtomicU32,
    pub(crate) scope: Arc<Scope>,
    pub(crate) affinity: AtomicU64,

    /// Number of tasks that must retire before this one is ready. Reaches
    /// zero exactly once per lifetime; the decrement that lands on zero is
    /// the only place a ready transition may be observed.
    pub(crate) pending_dependency_count: AtomicU32,

    /// The follow-on task whose counter this task decrements on retirement.
    /// Set at most once, taken exactly once on the terminal path.
    pub(crate) completion_task: Mutex<Option<TaskRef>>,

    pub(crate) cleanup_fn: Mutex<Option<CleanupFn>>,

    /// Set when the record came from a pool; the record is returned there
    /// after cleanup.
    pub(crate) pool: Mutex<Option<Arc<TaskPool>>>,
}

impl Task {
    pub(crate) fn from_body(scope: &Arc<Scope>, body: Body) -> Task {
        let task = Task {
            body,
            flags: AtomicU32::new(0),
            scope: Arc::clone(scope),
            affinity: AtomicU64::new(AffinitySet::any().0),
            pending_dependency_count: AtomicU32::new(0),
            completion_task: Mutex::new(None),
            cleanup_fn: Mutex::new(None),
            pool: Mutex::new(None),
        };
        if task.holds_scope_open() {
            scope.begin();
        }
        task
    }

    pub fn nop(scope: &Arc<Scope>) -> TaskRef {
        Arc::new(Self::from_body(scope, Body::Nop))
    }

    pub fn call(
        scope: &Arc<Scope>,
        closure: impl Fn(&mut Submission) -> TaskResult + Send + Sync + 'static,
    ) -> TaskRef {
        Arc::new(Self::from_body(
            scope,
            Body::Call(CallBody {
                closure: Box::new(closure),
                status: StatusLatch::new(),
            }),
        ))
    }

    pub fn barrier(scope: &Arc<Scope>, dependent_tasks: Vec<TaskRef>) -> TaskRef {
        for dependent in &dependent_tasks {
            dependent
                .pending_dependency_count
                .fetch_add(1, Ordering::Relaxed);
        }
        Arc::new(Self::from_body(
            scope,
            Body::Barrier(BarrierBody {
                dependent_tasks: Mutex::new(dependent_tasks),
            }),
        ))
    }

    /// A barrier with no dependents yet; bind them later with
    /// [`Task::set_barrier_dependents`] before submitting anything that can
    /// retire the barrier.
    pub fn barrier_empty(scope: &Arc<Scope>) -> TaskRef {
        Self::barrier(scope, Vec::new())
    }

    pub fn fence(scope: &Arc<Scope>) -> TaskRef {
        Arc::new(Self::from_body(scope, Body::Fence))
    }

    pub fn wait(scope: &Arc<Scope>, handle: WaitHandle) -> TaskRef {
        Arc::new(Self::from_body(scope, Body::Wait(WaitBody { handle })))
    }

    pub fn kind(&self) -> TaskKind {
        match &self.body {
            Body::Nop => TaskKind::Nop,
            Body::Call(_) => TaskKind::Call,
            Body::Barrier(_) => TaskKind::Barrier,
            Body::Fence => TaskKind::Fence,
            Body::Wait(_) => TaskKind::Wait,
            Body::Dispatch(_) => TaskKind::Dispatch,
            Body::DispatchSlice(_) => TaskKind::DispatchSlice,
            Body::DispatchShard(_) => TaskKind::DispatchShard,
        }
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub(crate) fn body(&self) -> &Body {
        &self.body
    }

    /// Whether this task holds its scope open for the duration of its life.
    /// Nops, barriers and waits are scheduling plumbing and do not.
    fn holds_scope_open(&self) -> bool {
        matches!(
            self.kind(),
            TaskKind::Fence
                | TaskKind::Call
                | TaskKind::Dispatch
                | TaskKind::DispatchSlice
                | TaskKind::DispatchShard
        )
    }

    /// Registers `completion_task` to run after this task retires.
    ///
    /// The edge can be set at most once per task.
    pub fn set_completion_task(&self, completion_task: &TaskRef) {
        let mut slot = self.completion_task.lock();
        debug_assert!(slot.is_none(), "completion task already set");
        completion_task
            .pending_dependency_count
            .fetch_add(1, Ordering::Relaxed);
        *slot = Some(Arc::clone(completion_task));
    }

    /// Late-binds the dependents of a barrier created with
    /// [`Task::barrier_empty`].
    pub fn set_barrier_dependents(&self, dependent_tasks: Vec<TaskRef>) {
        let Body::Barrier(barrier) = &self.body else {
            panic!("set_barrier_dependents on a non-barrier task");
        };
        let mut slot = barrier.dependent_tasks.lock();
        debug_assert!(slot.is_empty(), "barrier dependents already set");
        for dependent in &dependent_tasks {
            dependent
                .pending_dependency_count
                .fetch_add(1, Ordering::Relaxed);
        }
        *slot = dependent_tasks;
    }

    pub fn is_ready(&self) -> bool {
        self.pending_dependency_count.load(Ordering::Relaxed) == 0
    }

    /// Registers a callback invoked exactly once when the task reaches a
    /// terminal state, with `StatusCode::Ok` on retire and
    /// `StatusCode::Aborted` on discard.
    pub fn set_cleanup_fn(&self, cleanup_fn: impl FnOnce(StatusCode) + Send + 'static) {
        let mut slot = self.cleanup_fn.lock();
        debug_assert!(slot.is_none(), "cleanup fn already set");
        *slot = Some(Box::new(cleanup_fn));
    }

    pub fn affinity(&self) -> AffinitySet {
        AffinitySet(self.affinity.load(Ordering::Relaxed))
    }

    pub fn set_affinity(&self, affinity: AffinitySet) {
        self.affinity.store(affinity.0, Ordering::Relaxed);
    }

    pub(crate) fn has_flag(&self, flag: TaskFlags) -> bool {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(flag)
    }

    pub(crate) fn set_flag(&self, flag: TaskFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Release);
    }

    pub(crate) fn clear_flag(&self, flag: TaskFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Release);
    }

    pub(crate) fn take_completion_task(&self) -> Option<TaskRef> {
        self.completion_task.lock().take()
    }

    pub(crate) fn set_pool(&self, pool: &Arc<TaskPool>) {
        *self.pool.lock() = Some(Arc::clone(pool));
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind())
            .field(
                "flags",
                &TaskFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed)),
            )
            .field(
                "pending",
                &self.pending_dependency_count.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Runs the cleanup callback, updates scope accounting and returns the record
/// to its pool. Invoked exactly once per task, on both terminal paths.
pub(crate) fn cleanup(task: &TaskRef, status_code: StatusCode) {
    // Take the pool link first: once cleanup ran nothing may observe the
    // record again, and the pool must not hand it out before that.
    let pool = task.pool.lock().take();

    if let Some(cleanup_fn) = task.cleanup_fn.lock().take() {
        cleanup_fn(status_code);
    }

    match status_code {
        StatusCode::Ok => task.scope.record_retired(),
        _ => task.scope.record_discarded(),
    }
    if task.holds_scope_open() {
        task.scope.end();
    }

    if let Some(pool) = pool {
        pool.release(Arc::clone(task));
    }
}

/// Terminal transition for a completed task.
///
/// Decrements the completion task's counter; if that was the last pending
/// dependency the completion task is enqueued into the worker's pending
/// submission (on success) or discarded along with everything downstream of
/// it (on failure). A failure also latches into the scope.
pub(crate) fn retire(task: TaskRef, pending_submission: &mut Submission, status: TaskResult) {
    debug_assert_eq!(
        task.pending_dependency_count.load(Ordering::Acquire),
        0,
        "retiring a task with pending dependencies"
    );

    let completion_task = task.take_completion_task();
    let completion_ready = completion_task.as_ref().is_some_and(|completion| {
        completion
            .pending_dependency_count
            .fetch_sub(1, Ordering::AcqRel)
            == 1
    });

    match status {
        Ok(()) => {
            cleanup(&task, StatusCode::Ok);
            if completion_ready {
                // Last pending dependency satisfied; the completion task is
                // ready to run.
                pending_submission.enqueue(completion_task.expect("ready completion task"));
            }
        }
        Err(err) => {
            task.scope.fail(err);
            cleanup(&task, StatusCode::Aborted);
            if let Some(completion_task) = completion_task {
                if completion_ready {
                    // We released the last dependency, so nothing else can
                    // ready the completion task: discard it and its
                    // downstream here.
                    discard_chain(completion_task);
                } else {
                    // Other dependencies keep it alive; flag it so whichever
                    // decrement lands on zero discards it instead of running
                    // it.
                    completion_task.set_flag(TaskFlags::ABORTED);
                }
            }
        }
    }
}

/// Terminal transition for a task that must not execute.
///
/// Successors are handled with the same decrement discipline as a retire:
/// only the decrement that lands on zero transitions the successor (into the
/// discard worklist instead of a ready queue), and anything still held by
/// other dependencies is flagged for the final decrement to discard.
/// Pushing at the head makes the walk a DFS.
pub(crate) fn discard(task: TaskRef, discard_worklist: &mut TaskList) {
    if let Some(completion_task) = task.take_completion_task() {
        abort_successor(completion_task, discard_worklist);
    }
    if let Body::Barrier(barrier) = task.body() {
        let mut dependents = barrier.dependent_tasks.lock();
        for dependent in dependents.drain(..) {
            abort_successor(dependent, discard_worklist);
        }
    }

    cleanup(&task, StatusCode::Aborted);
    // NOTE: the record may already be back in its pool here.
}

fn abort_successor(successor: TaskRef, discard_worklist: &mut TaskList) {
    if successor
        .pending_dependency_count
        .fetch_sub(1, Ordering::AcqRel)
        == 1
    {
        discard_worklist.push_front(successor);
    } else {
        successor.set_flag(TaskFlags::ABORTED);
    }
}

/// Discards `task` and walks everything reachable through completion and
/// barrier edges.
pub(crate) fn discard_chain(task: TaskRef) {
    let mut discard_worklist = TaskList::new();
    discard(task, &mut discard_worklist);
    discard_worklist.discard_all();
}

/// Executes a call closure and retires the task if no nested dependencies
/// keep it alive. A task whose closure enqueued dependent work stays pending
/// and re-executes when that work completes.
pub(crate) fn call_execute(task: TaskRef, pending_submission: &mut Submission) {
    {
        let Body::Call(call) = task.body() else {
            unreachable!("call_execute on a non-call task");
        };
        if !task.has_flag(TaskFlags::ABORTED)
            && let Err(err) = (call.closure)(pending_submission)
        {
            call.status.fail(err);
        }
    }

    // Nested tasks enqueued by the closure may have re-armed the dependency
    // count; only retire once it is truly zero.
    if task.pending_dependency_count.load(Ordering::Acquire) == 0 {
        let status = {
            let Body::Call(call) = task.body() else {
                unreachable!();
            };
            call.status.take()
        };
        retire(task, pending_submission, status);
    }
}

/// Retires a barrier: every dependent loses one pending dependency, and the
/// ones that reach zero are enqueued. Walks in reverse so dependents are
/// enqueued in LIFO order.
pub(crate) fn barrier_retire(task: TaskRef, pending_submission: &mut Submission) {
    {
        let Body::Barrier(barrier) = task.body() else {
            unreachable!("barrier_retire on a non-barrier task");
        };
        let mut dependents = barrier.dependent_tasks.lock();
        for dependent in dependents.drain(..).rev() {
            if dependent
                .pending_dependency_count
                .fetch_sub(1, Ordering::AcqRel)
                == 1
            {
                pending_submission.enqueue(dependent);
            }
        }
    }
    retire(task, pending_submission, Ok(()));
}

/// Polls a wait task's condition. External signal polling is not wired to an
/// OS primitive; handles currently report completed as soon as checked.
pub(crate) fn wait_check_condition(task: &TaskRef) -> bool {
    task.set_flag(TaskFlags::WAIT_COMPLETED);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TaskError;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(Task: Send, Sync);
    assert_impl_all!(AffinitySet: Send, Sync, Copy);

    #[test]
    fn test_set_completion_task_arms_dependency() {
        let scope = Scope::new("deps");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);

        assert!(b.is_ready());
        a.set_completion_task(&b);
        assert!(!b.is_ready());
        assert_eq!(b.pending_dependency_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_barrier_arms_all_dependents() {
        let scope = Scope::new("barrier");
        let c = Task::nop(&scope);
        let barrier = Task::barrier(&scope, vec![c.clone(), c.clone()]);

        assert_eq!(c.pending_dependency_count.load(Ordering::Relaxed), 2);

        let mut pending = Submission::new();
        barrier_retire(barrier, &mut pending);
        assert!(c.is_ready());
        assert_eq!(pending.ready.len(), 1);
    }

    #[test]
    fn test_barrier_dependents_bound_late() {
        let scope = Scope::new("late-barrier");
        let barrier = Task::barrier_empty(&scope);
        let c = Task::nop(&scope);
        barrier.set_barrier_dependents(vec![c.clone()]);
        assert!(!c.is_ready());

        let mut pending = Submission::new();
        barrier_retire(barrier, &mut pending);
        assert!(c.is_ready());
        assert_eq!(pending.ready.len(), 1);
    }

    #[test]
    fn test_retire_readies_completion_task() {
        let scope = Scope::new("retire");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);
        a.set_completion_task(&b);

        let mut pending = Submission::new();
        retire(a, &mut pending, Ok(()));

        let readied = pending.ready.pop_front().unwrap();
        assert!(Arc::ptr_eq(&readied, &b));
        assert_eq!(scope.tasks_retired(), 1);
    }

    #[test]
    fn test_failed_retire_discards_downstream() {
        let scope = Scope::new("fail");
        let a = Task::call(&scope, |_| Ok(()));
        let b = Task::nop(&scope);
        let c = Task::nop(&scope);
        a.set_completion_task(&b);
        b.set_completion_task(&c);

        let cleanup_codes = Arc::new(Mutex::new(Vec::new()));
        for task in [&b, &c] {
            let codes = Arc::clone(&cleanup_codes);
            task.set_cleanup_fn(move |code| codes.lock().push(code));
        }

        let mut pending = Submission::new();
        retire(a, &mut pending, Err(TaskError::InvalidArgument("bad".into())));

        assert!(scope.is_failed());
        assert!(pending.ready.is_empty());
        assert_eq!(
            cleanup_codes.lock().as_slice(),
            &[StatusCode::Aborted, StatusCode::Aborted]
        );
        assert_eq!(scope.tasks_discarded(), 3);
    }

    #[test]
    fn test_discard_flags_partially_satisfied_successor() {
        let scope = Scope::new("partial");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);
        let c = Task::nop(&scope);
        a.set_completion_task(&c);
        b.set_completion_task(&c);

        // Discarding a releases one of c's two dependencies; c must survive
        // flagged, not discarded.
        discard_chain(a);
        assert!(c.has_flag(TaskFlags::ABORTED));
        assert!(!c.is_ready());

        // The final decrement lands on zero and readies the flagged task;
        // whoever pops it will discard instead of executing.
        let mut pending = Submission::new();
        retire(b, &mut pending, Ok(()));
        let readied = pending.ready.pop_front().unwrap();
        assert!(readied.has_flag(TaskFlags::ABORTED));
    }

    #[test]
    fn test_call_execute_runs_closure_once_ready() {
        let scope = Scope::new("call");
        let calls = Arc::new(AtomicUsize::new(0));
        let task = {
            let calls = Arc::clone(&calls);
            Task::call(&scope, move |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        };

        let mut pending = Submission::new();
        call_execute(task, &mut pending);

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(scope.is_idle());
        assert_eq!(scope.tasks_retired(), 1);
    }

    #[test]
    fn test_aborted_call_skips_closure() {
        let scope = Scope::new("aborted-call");
        let calls = Arc::new(AtomicUsize::new(0));
        let task = {
            let calls = Arc::clone(&calls);
            Task::call(&scope, move |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        };
        task.set_flag(TaskFlags::ABORTED);

        let mut pending = Submission::new();
        call_execute(task, &mut pending);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_affinity_set_eligibility() {
        let set = AffinitySet::worker(1).with_worker(3);
        assert!(!set.allows(0));
        assert!(set.allows(1));
        assert!(set.allows(3));
        assert_eq!(set.eligible_workers(4).as_slice(), &[1, 3]);
        assert!(set.eligible_workers(1).is_empty());
        assert_eq!(AffinitySet::any().eligible_workers(2).as_slice(), &[0, 1]);
        assert!(AffinitySet::none().eligible_workers(8).is_empty());
    }
}
