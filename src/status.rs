use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Result of executing a task closure or waiting on a scope.
pub type TaskResult = Result<(), TaskError>;

/// Errors surfaced by the executor or latched from user closures.
///
/// Closures return whatever they like through [`TaskError::user`]; the
/// executor treats those statuses as opaque and only routes them. Everything
/// is clonable because the first failure in a scope fans out to every waiter.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task was discarded before (or instead of) executing, either
    /// because its scope failed or because a predecessor aborted.
    #[error("task aborted")]
    Aborted,

    /// A pool ran out of records or a dispatch asked for more worker-local
    /// memory than the executor provides.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A task was constructed or submitted in a way the executor rejects.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A scope wait timed out before the scope went idle.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Opaque user status from a call or tile closure, passed through as-is.
    #[error("{0}")]
    User(Arc<anyhow::Error>),
}

impl TaskError {
    /// Wraps an arbitrary user error so it can flow through the executor.
    pub fn user(err: impl Into<anyhow::Error>) -> Self {
        Self::User(Arc::new(err.into()))
    }

    pub fn code(&self) -> StatusCode {
        match self {
            Self::Aborted => StatusCode::Aborted,
            Self::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::DeadlineExceeded => StatusCode::DeadlineExceeded,
            Self::User(_) => StatusCode::Unknown,
        }
    }
}

/// Coarse status discriminant handed to cleanup callbacks.
///
/// Cleanup runs exactly once per task, on both terminal paths: `Ok` when the
/// task retired normally, `Aborted` when it was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Aborted,
    ResourceExhausted,
    InvalidArgument,
    DeadlineExceeded,
    Unknown,
}

/// First-writer-wins status cell.
///
/// This is the one fan-in primitive shared by call tasks, dispatches and
/// scopes: many concurrent producers may fail, exactly one status survives,
/// later failures are dropped. The lock only ever guards the rare failure
/// path; the common case is a single uncontended check at retire time.
#[derive(Debug, Default)]
pub struct StatusLatch(Mutex<Option<TaskError>>);

impl StatusLatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Latches `err` if no status has been latched yet; otherwise drops it.
    pub(crate) fn fail(&self, err: TaskError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    /// Clones the latched status out, leaving the latch set.
    pub(crate) fn get(&self) -> Option<TaskError> {
        self.0.lock().clone()
    }

    /// Consumes the latched status, resetting the latch.
    pub(crate) fn take(&self) -> TaskResult {
        match self.0.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskError: Send, Sync, Clone);
    assert_impl_all!(StatusLatch: Send, Sync);

    #[test]
    fn test_first_failure_wins() {
        let latch = StatusLatch::new();
        assert!(!latch.is_set());

        latch.fail(TaskError::InvalidArgument("first".into()));
        latch.fail(TaskError::Aborted);

        assert!(latch.is_set());
        let err = latch.get().unwrap();
        assert_eq!(err.code(), StatusCode::InvalidArgument);

        // Taking consumes the latch; a later failure can latch again.
        assert!(matches!(
            latch.take(),
            Err(TaskError::InvalidArgument(msg)) if msg == "first"
        ));
        assert!(latch.take().is_ok());
    }

    #[test]
    fn test_user_status_is_opaque_and_clonable() {
        let err = TaskError::user(std::io::Error::other("backing store gone"));
        let clone = err.clone();

        assert_eq!(err.code(), StatusCode::Unknown);
        assert_eq!(clone.code(), StatusCode::Unknown);
        assert_eq!(err.to_string(), "backing store gone");
    }
}
