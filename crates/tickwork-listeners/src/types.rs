use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tickwork_core::model::{JobKind, RunStatus};
use tickwork_core::types::{InstanceName, JobId, RunId, TriggerId};

use crate::error::Result;

/// Lifecycle transitions and loop errors of one scheduler instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SchedulerEventKind {
    Started,
    /// Started without scanning; the instance only heartbeats and runs manual fires.
    Standby,
    Stopped,
    /// A loop iteration failed or panicked; the loop carries on.
    Error { context: String, message: String },
}

impl SchedulerEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerEventKind::Started => "started",
            SchedulerEventKind::Standby => "standby",
            SchedulerEventKind::Stopped => "stopped",
            SchedulerEventKind::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub namespace: String,
    pub instance_name: InstanceName,
    pub kind: SchedulerEventKind,
    pub at: DateTime<Utc>,
}

impl SchedulerEvent {
    pub fn new(namespace: impl Into<String>, instance_name: InstanceName, kind: SchedulerEventKind) -> Self {
        Self {
            namespace: namespace.into(),
            instance_name,
            kind,
            at: Utc::now(),
        }
    }
}

/// A trigger occurrence claimed by the scanner, fired or skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub namespace: String,
    pub trigger_id: TriggerId,
    pub job_id: JobId,
    pub fire_at: DateTime<Utc>,
    pub instance_name: InstanceName,
    /// Misfire policy outcome, if any.
    pub note: Option<String>,
}

/// One attempt of one run, as seen by job listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub namespace: String,
    pub run_id: RunId,
    pub job_id: JobId,
    pub job_name: String,
    pub kind: JobKind,
    pub trigger_id: Option<TriggerId>,
    pub fire_at: DateTime<Utc>,
    /// 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
    pub manual: bool,
    pub instance_name: InstanceName,
}

/// Scheduler lifecycle observer.
///
/// Callbacks run on the caller's task and must stay short. Errors and panics
/// are logged by the bus and never reach the scheduler.
pub trait SchedulerListener: Send + Sync {
    fn on_scheduler_event(&self, event: &SchedulerEvent) -> Result<()>;
}

/// Trigger fire/misfire observer.
pub trait TriggerListener: Send + Sync {
    fn trigger_fired(&self, _event: &TriggerEvent) -> Result<()> {
        Ok(())
    }

    fn trigger_misfired(&self, _event: &TriggerEvent) -> Result<()> {
        Ok(())
    }
}

/// Job run observer. `job_retrying` fires between attempts; exactly one of
/// `job_succeeded` / `job_failed` ends every run.
pub trait JobListener: Send + Sync {
    fn job_started(&self, _event: &JobEvent) -> Result<()> {
        Ok(())
    }

    fn job_retrying(&self, _event: &JobEvent, _reason: &str) -> Result<()> {
        Ok(())
    }

    fn job_succeeded(&self, _event: &JobEvent, _output: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn job_failed(&self, _event: &JobEvent, _status: RunStatus, _reason: &str) -> Result<()> {
        Ok(())
    }
}
