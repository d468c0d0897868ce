//! Error types for the tickwork-executors crate.

use thiserror::Error;
use tickwork_core::model::JobKind;

/// Failures inside an executor before an [`Outcome`](crate::types::Outcome)
/// is produced. Executors fold these into `Outcome::Failure`.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The job handed to an executor carries another kind's payload.
    #[error("Executor {executor} cannot run {kind} payloads")]
    PayloadMismatch { executor: &'static str, kind: JobKind },

    #[error("No executor registered for job kind {0}")]
    NoExecutor(JobKind),

    #[error("Procedure not found: {0}")]
    ProcedureNotFound(String),

    /// A procedure reported failure.
    #[error("Procedure failed: {0}")]
    ProcedureFailed(String),

    #[error("Script error: {0}")]
    Script(String),

    /// Child process could not be spawned.
    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ExecutorError>;
