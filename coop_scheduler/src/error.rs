//! Scheduler error types

use core_types::{EventId, LockId, TaskId};
use host_bridge::ForeignCallError;
use std::fmt;
use thiserror::Error;

/// Errors a task observes at a resumption point
///
/// Task bodies return these to fail; the scheduler hands them in through
/// [`crate::Resume::Interrupted`] when a wait ends abnormally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The awaited condition lost its race against a timeout
    #[error("Timed out")]
    Timeout,

    /// The task was cancelled
    #[error("Task cancelled")]
    Cancelled,

    /// A call through the bridge failed
    #[error("Foreign call failed: {0}")]
    Host(#[from] ForeignCallError),

    /// A scheduler request made by the task was rejected
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// The task body failed
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Wraps any displayable error as a task failure
    pub fn failed(err: impl fmt::Display) -> Self {
        TaskError::Failed(err.to_string())
    }
}

/// Errors from the scheduler itself
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Tasks are suspended and nothing can ever wake them
    #[error("Scheduler deadlock: {} task(s) suspended with no pending wakeup", suspended.len())]
    Deadlock { suspended: Vec<TaskId> },

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Unknown lock: {0}")]
    UnknownLock(LockId),

    #[error("Unknown event: {0}")]
    UnknownEvent(EventId),

    #[error("{lock} is not held by {task}")]
    NotLockOwner { lock: LockId, task: TaskId },

    #[error("Task limit reached ({limit})")]
    TooManyTasks { limit: usize },
}

impl SchedulerError {
    /// Fatal errors end the run loop; everything else is local to a call
    pub fn is_fatal(&self) -> bool {
        matches!(self, SchedulerError::Deadlock { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_deadlock_is_fatal() {
        assert!(SchedulerError::Deadlock { suspended: vec![] }.is_fatal());
        assert!(!SchedulerError::TooManyTasks { limit: 4 }.is_fatal());
    }

    #[test]
    fn test_deadlock_message_counts_tasks() {
        let err = SchedulerError::Deadlock {
            suspended: vec![TaskId::new(), TaskId::new()],
        };
        assert_eq!(
            err.to_string(),
            "Scheduler deadlock: 2 task(s) suspended with no pending wakeup"
        );
    }

    #[test]
    fn test_host_error_kept_in_task_error() {
        let err = TaskError::from(ForeignCallError::Host {
            method: "then".to_string(),
            message: "boom".to_string(),
        });
        assert_eq!(err.to_string(), "Foreign call failed: Host error in then: boom");
    }
}
