use tickwork_core::model::RunStatus;
use tracing::{info, warn};

use crate::error::Result;
use crate::types::{
    JobEvent, JobListener, SchedulerEvent, SchedulerEventKind, SchedulerListener, TriggerEvent,
    TriggerListener,
};

/// Audit trail of every bus event through `tracing`.
///
/// Registered on all three chains by the runtime at priority `i32::MIN` so
/// the log line precedes any user listener's side effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl SchedulerListener for TracingListener {
    fn on_scheduler_event(&self, event: &SchedulerEvent) -> Result<()> {
        match &event.kind {
            SchedulerEventKind::Error { context, message } => warn!(
                namespace = %event.namespace,
                instance = %event.instance_name,
                context = %context,
                "scheduler error: {message}"
            ),
            kind => info!(
                namespace = %event.namespace,
                instance = %event.instance_name,
                event = kind.name(),
                "scheduler lifecycle"
            ),
        }
        Ok(())
    }
}

impl TriggerListener for TracingListener {
    fn trigger_fired(&self, event: &TriggerEvent) -> Result<()> {
        info!(
            trigger_id = %event.trigger_id,
            job_id = %event.job_id,
            fire_at = %event.fire_at,
            instance = %event.instance_name,
            "trigger fired"
        );
        Ok(())
    }

    fn trigger_misfired(&self, event: &TriggerEvent) -> Result<()> {
        warn!(
            trigger_id = %event.trigger_id,
            job_id = %event.job_id,
            fire_at = %event.fire_at,
            note = event.note.as_deref().unwrap_or(""),
            "trigger misfired"
        );
        Ok(())
    }
}

impl JobListener for TracingListener {
    fn job_started(&self, event: &JobEvent) -> Result<()> {
        info!(
            job_id = %event.job_id,
            job = %event.job_name,
            kind = %event.kind,
            run_id = %event.run_id,
            attempt = event.attempt,
            manual = event.manual,
            "job attempt started"
        );
        Ok(())
    }

    fn job_retrying(&self, event: &JobEvent, reason: &str) -> Result<()> {
        warn!(
            job_id = %event.job_id,
            run_id = %event.run_id,
            attempt = event.attempt,
            max_attempts = event.max_attempts,
            "job attempt failed, retrying: {reason}"
        );
        Ok(())
    }

    fn job_succeeded(&self, event: &JobEvent, _output: Option<&str>) -> Result<()> {
        info!(
            job_id = %event.job_id,
            run_id = %event.run_id,
            attempt = event.attempt,
            "job succeeded"
        );
        Ok(())
    }

    fn job_failed(&self, event: &JobEvent, status: RunStatus, reason: &str) -> Result<()> {
        warn!(
            job_id = %event.job_id,
            run_id = %event.run_id,
            attempt = event.attempt,
            status = %status,
            "job failed: {reason}"
        );
        Ok(())
    }
}
