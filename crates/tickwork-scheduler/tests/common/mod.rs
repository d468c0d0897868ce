#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tickwork_core::config::SchedulerConfig;
use tickwork_core::model::{JobKind, JobPayload, NewJob, ProcedureJob, RunStatus};
use tickwork_core::types::InstanceName;
use tickwork_executors::{Executor, JobContext, Outcome};
use tickwork_listeners::{JobEvent, JobListener};
use tickwork_scheduler::{ClusterCoordinator, ManualClock, Store};

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
}

pub fn procedure_job(name: &str) -> NewJob {
    NewJob::new(
        "default",
        name,
        JobPayload::Procedure(ProcedureJob {
            name: "noop".to_string(),
            args: json!(null),
        }),
    )
}

pub fn coordinator(
    store: Arc<Store>,
    clock: Arc<ManualClock>,
    name: &str,
    heartbeat_ms: u64,
) -> Arc<ClusterCoordinator> {
    let config = SchedulerConfig {
        heartbeat_interval_ms: heartbeat_ms,
        lock_wait_ms: 50,
        ..SchedulerConfig::default()
    };
    Arc::new(ClusterCoordinator::new(&config, InstanceName::from(name), store, clock))
}

/// Scripted executor for the procedure kind: plays `script` in order, then
/// repeats its last entry.
pub struct ScriptedExecutor {
    script: Vec<Step>,
    pub calls: AtomicU32,
    pub saw_cancel: Arc<Mutex<bool>>,
}

#[derive(Clone)]
pub enum Step {
    Succeed(&'static str),
    Fail(&'static str),
    Sleep(Duration),
    Panic,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicU32::new(0),
            saw_cancel: Arc::new(Mutex::new(false)),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, kind: JobKind) -> bool {
        kind == JobKind::Procedure
    }

    async fn execute(&self, ctx: &JobContext) -> Outcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let step = self.script[n.min(self.script.len() - 1)].clone();
        match step {
            Step::Succeed(out) => Outcome::success(Some(out.to_string())),
            Step::Fail(reason) => Outcome::failure(reason),
            Step::Sleep(d) => {
                let flag = Arc::clone(&self.saw_cancel);
                let token = ctx.cancel.clone();
                // Outlives the attempt future so a timeout-driven cancel is observable.
                tokio::spawn(async move {
                    token.cancelled().await;
                    *flag.lock().unwrap() = true;
                });
                tokio::time::sleep(d).await;
                Outcome::success(None)
            }
            Step::Panic => panic!("executor blew up"),
        }
    }
}

/// Records job listener callbacks as short strings.
#[derive(Default)]
pub struct JobRecorder {
    pub calls: Mutex<Vec<String>>,
}

impl JobRecorder {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl JobListener for JobRecorder {
    fn job_started(&self, event: &JobEvent) -> tickwork_listeners::Result<()> {
        self.calls.lock().unwrap().push(format!("started:{}", event.attempt));
        Ok(())
    }

    fn job_retrying(&self, event: &JobEvent, _reason: &str) -> tickwork_listeners::Result<()> {
        self.calls.lock().unwrap().push(format!("retrying:{}", event.attempt));
        Ok(())
    }

    fn job_succeeded(&self, event: &JobEvent, _output: Option<&str>) -> tickwork_listeners::Result<()> {
        self.calls.lock().unwrap().push(format!("succeeded:{}", event.attempt));
        Ok(())
    }

    fn job_failed(&self, event: &JobEvent, status: RunStatus, _reason: &str) -> tickwork_listeners::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("failed:{}:{status}", event.attempt));
        Ok(())
    }
}
