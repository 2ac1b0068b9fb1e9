//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
///
/// Job failures and timeouts are not errors at this level: they are folded
/// into the next task state by the execution context.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A schedule request could not be accepted.
    #[error("invalid schedule entry: {0}")]
    InvalidEntry(String),

    /// A task references a job name that is not registered.
    #[error("unknown job '{job}' for task {task_id}")]
    UnknownJob { task_id: String, job: String },

    /// An execution context operation was called out of order.
    #[error("invalid context state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    /// Invalid scheduler configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The task store rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing a task file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
