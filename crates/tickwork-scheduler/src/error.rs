use thiserror::Error;
use tickwork_core::model::JobKind;
use tickwork_core::types::{JobId, TriggerId};
use tickwork_core::TickworkError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The schedule cannot produce fire times (malformed cron, zero interval).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A job or trigger definition failed validation.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    #[error("Trigger not found: {id}")]
    TriggerNotFound { id: TriggerId },

    #[error("No executor registered for job kind {0}")]
    NoExecutor(JobKind),

    /// The dispatch queue is full; the fire was rejected.
    #[error("Dispatch queue full ({queue_depth} pending)")]
    Backpressure { queue_depth: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Another instance held the cluster lock for longer than `lock_wait_ms`.
    #[error("Cluster lock {0} is busy")]
    LockBusy(&'static str),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl From<TickworkError> for SchedulerError {
    fn from(e: TickworkError) -> Self {
        match e {
            TickworkError::Config(msg) => SchedulerError::Config(msg),
            TickworkError::Serialization(e) => SchedulerError::Serialization(e),
            other => SchedulerError::InvalidJob(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
