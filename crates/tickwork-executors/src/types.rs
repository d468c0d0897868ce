use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tickwork_core::model::{Job, JobKind, RunStatus};
use tickwork_core::types::{InstanceName, RunId};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Everything an executor may know about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Arc<Job>,
    pub run_id: RunId,
    /// 1-based.
    pub attempt: u32,
    pub fire_at: DateTime<Utc>,
    pub manual: bool,
    pub instance_name: InstanceName,
    /// Cancelled on timeout and on scheduler shutdown.
    pub cancel: CancellationToken,
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    Success { output: Option<String> },
    Failure { reason: String },
    Timeout,
}

impl Outcome {
    pub fn success(output: impl Into<Option<String>>) -> Self {
        Outcome::Success {
            output: output.into(),
        }
    }

    pub fn failure(reason: impl std::fmt::Display) -> Self {
        Outcome::Failure {
            reason: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Outcome::Success { .. } => RunStatus::Succeeded,
            Outcome::Failure { .. } => RunStatus::Failed,
            Outcome::Timeout => RunStatus::TimedOut,
        }
    }
}

impl From<crate::error::ExecutorError> for Outcome {
    fn from(e: crate::error::ExecutorError) -> Self {
        Outcome::failure(e)
    }
}

/// A pluggable runner for one or more job kinds.
///
/// Implementations never see retries or timeouts: dispatch owns both. An
/// executor should still watch `ctx.cancel` if it holds resources that
/// outlive its future (child processes, blocking threads).
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, kind: JobKind) -> bool;

    async fn execute(&self, ctx: &JobContext) -> Outcome;
}
