//! Error types for the scheduler.

use std::time::Duration;

use census_types::TaskId;

/// Errors from the resource lock registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The lock stayed held by another owner for the whole wait ceiling.
    #[error("Lock acquisition timeout for resource {resource} after {waited:?}")]
    Timeout {
        /// The contended resource name.
        resource: String,
        /// How long the caller waited.
        waited: Duration,
    },
}

/// Errors returned to the submitter of a queued task.
///
/// `E` is the task's own error type. It is carried unmodified in
/// [`QueueError::Task`].
#[derive(Debug, thiserror::Error)]
pub enum QueueError<E> {
    /// A required resource lock could not be acquired in time.
    #[error("Lock acquisition timeout for resource {resource} after {waited:?}")]
    LockAcquisitionTimeout {
        /// The contended resource name.
        resource: String,
        /// How long the task waited.
        waited: Duration,
    },

    /// A dependency was still in flight when the dependency timeout elapsed.
    #[error("Timed out after {waited:?} waiting for dependency {dependency}")]
    DependencyTimeout {
        /// The dependency that never completed.
        dependency: TaskId,
        /// How long the task waited.
        waited: Duration,
    },

    /// The work itself failed (after any deadlock retries).
    #[error("{0}")]
    Task(E),

    /// The task's runtime task panicked or was cancelled before it
    /// produced a result. Its locks and slot were released on unwind.
    #[error("Task {task} aborted: {reason}")]
    Aborted {
        /// The task that stopped.
        task: TaskId,
        /// Panic message or cancellation notice.
        reason: String,
    },
}

impl<E> QueueError<E> {
    /// The work's own error, if that is what failed.
    pub const fn task_error(&self) -> Option<&E> {
        match self {
            Self::Task(e) => Some(e),
            Self::LockAcquisitionTimeout { .. }
            | Self::DependencyTimeout { .. }
            | Self::Aborted { .. } => None,
        }
    }

    /// Consume the error, keeping only the work's own error.
    pub fn into_task_error(self) -> Option<E> {
        match self {
            Self::Task(e) => Some(e),
            Self::LockAcquisitionTimeout { .. }
            | Self::DependencyTimeout { .. }
            | Self::Aborted { .. } => None,
        }
    }

    /// Whether the task never ran because it could not be scheduled.
    pub const fn is_scheduling_failure(&self) -> bool {
        matches!(self, Self::LockAcquisitionTimeout { .. } | Self::DependencyTimeout { .. })
    }
}

impl<E> From<LockError> for QueueError<E> {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { resource, waited } => Self::LockAcquisitionTimeout { resource, waited },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_converts() {
        let err: QueueError<std::io::Error> = LockError::Timeout {
            resource: String::from("file:a"),
            waited: Duration::from_secs(60),
        }
        .into();
        assert!(err.is_scheduling_failure());
        assert!(err.task_error().is_none());
        assert!(err.to_string().contains("file:a"));
    }

    #[test]
    fn task_error_is_unmodified() {
        let err: QueueError<String> = QueueError::Task(String::from("row 7 rejected"));
        assert_eq!(err.to_string(), "row 7 rejected");
        assert_eq!(err.into_task_error().as_deref(), Some("row 7 rejected"));
    }

    #[test]
    fn aborted_is_neither_task_nor_scheduling_failure() {
        let task = TaskId::new();
        let err: QueueError<String> = QueueError::Aborted {
            task,
            reason: String::from("panicked"),
        };
        assert!(!err.is_scheduling_failure());
        assert!(err.task_error().is_none());
        assert_eq!(err.to_string(), format!("Task {task} aborted: panicked"));
    }
}
