//! Scheduler error types

use thiserror::Error;

use super::task::TaskId;

/// Errors returned by scheduler operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler closed: submissions are no longer accepted")]
    Closed,

    #[error("Invalid scheduler config: {0}")]
    InvalidConfig(String),

    #[error("No tokio runtime available to spawn the scheduler loop")]
    NoRuntime,

    #[error("Scheduler loop panicked")]
    WorkerPanicked,
}

impl SchedulerError {
    /// Check if this is a closed-scheduler rejection
    pub fn is_closed(&self) -> bool {
        matches!(self, SchedulerError::Closed)
    }
}

/// A task body failed while executing
///
/// Delivered to the error sink exactly once per failing task; never
/// propagated to the loop or to other tasks.
#[derive(Debug, Error)]
pub enum TaskExecutionError {
    #[error("Task {task_id} failed: {error}")]
    Failed { task_id: TaskId, error: eyre::Report },

    #[error("Task {task_id} panicked: {message}")]
    Panicked { task_id: TaskId, message: String },
}

impl TaskExecutionError {
    /// Id of the task that failed
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskExecutionError::Failed { task_id, .. } | TaskExecutionError::Panicked { task_id, .. } => *task_id,
        }
    }

    /// Check if the task body panicked rather than returning an error
    pub fn is_panic(&self) -> bool {
        matches!(self, TaskExecutionError::Panicked { .. })
    }
}
