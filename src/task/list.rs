use crate::task::{self, TaskKind, TaskRef};
use std::collections::VecDeque;

/// Worklist of task handles with O(1) push/pop at both ends.
///
/// The discard walk pushes at the head and pops from the head, which makes it
/// a DFS over the dependency graph and keeps the records it touches hot.
#[derive(Default)]
pub struct TaskList {
    tasks: VecDeque<TaskRef>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn push_front(&mut self, task: TaskRef) {
        self.tasks.push_front(task);
    }

    pub fn push_back(&mut self, task: TaskRef) {
        self.tasks.push_back(task);
    }

    pub fn pop_front(&mut self) -> Option<TaskRef> {
        self.tasks.pop_front()
    }

    /// Moves every task of `other` to the back of `self`.
    pub fn append(&mut self, other: &mut TaskList) {
        self.tasks.append(&mut other.tasks);
    }

    /// Discards every task in the list, walking their dependents depth-first.
    /// Each discarded task runs its cleanup with `StatusCode::Aborted`.
    pub(crate) fn discard_all(&mut self) {
        while let Some(next) = self.pop_front() {
            task::discard(next, self);
        }
    }
}

impl std::fmt::Debug for TaskList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskList").field("len", &self.len()).finish()
    }
}

/// A batch of root tasks handed to the executor, plus the worker-local
/// pending batch used to coalesce retirement side effects.
///
/// `ready` tasks are admissible immediately; `waiting` tasks sit behind an
/// external signal and are only admitted once their wait condition reports
/// completed. Call closures receive a `&mut Submission` and may enqueue
/// follow-on work into it; the worker publishes the whole batch once the
/// closure returns.
#[derive(Debug, Default)]
pub struct Submission {
    pub(crate) ready: TaskList,
    pub(crate) waiting: TaskList,
}

impl Submission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.waiting.is_empty()
    }

    /// Adds a root task to the batch. Wait tasks land on the waiting list;
    /// everything else must already be ready (no pending dependencies).
    pub fn enqueue(&mut self, task: TaskRef) {
        if task.kind() == TaskKind::Wait {
            self.waiting.push_back(task);
        } else {
            debug_assert!(
                task.is_ready(),
                "only tasks with no pending dependencies can be enqueued"
            );
            self.ready.push_back(task);
        }
    }

    /// Moves every task of `other` into `self`, preserving order.
    pub fn append(&mut self, other: &mut Submission) {
        self.ready.append(&mut other.ready);
        self.waiting.append(&mut other.waiting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use crate::task::Task;

    #[test]
    fn test_head_push_pop_is_lifo() {
        let scope = Scope::new("list");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);

        let mut list = TaskList::new();
        list.push_front(a.clone());
        list.push_front(b.clone());

        assert_eq!(list.len(), 2);
        assert!(std::sync::Arc::ptr_eq(&list.pop_front().unwrap(), &b));
        assert!(std::sync::Arc::ptr_eq(&list.pop_front().unwrap(), &a));
        assert!(list.pop_front().is_none());
    }

    #[test]
    fn test_submission_routes_waits_to_waiting_list() {
        let scope = Scope::new("submission");
        let mut submission = Submission::new();

        submission.enqueue(Task::nop(&scope));
        submission.enqueue(Task::wait(&scope, crate::task::WaitHandle::new(7)));

        assert_eq!(submission.ready.len(), 1);
        assert_eq!(submission.waiting.len(), 1);
    }

    #[test]
    fn test_append_preserves_order() {
        let scope = Scope::new("append");
        let a = Task::nop(&scope);
        let b = Task::nop(&scope);

        let mut first = Submission::new();
        first.enqueue(a.clone());
        let mut second = Submission::new();
        second.enqueue(b.clone());

        first.append(&mut second);
        assert!(second.is_empty());
        assert!(std::sync::Arc::ptr_eq(&first.ready.pop_front().unwrap(), &a));
        assert!(std::sync::Arc::ptr_eq(&first.ready.pop_front().unwrap(), &b));
    }
}
