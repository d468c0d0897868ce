//! Bounded dispatch of fires to executors.
//!
//! [`Dispatcher::submit`] never blocks: fires queue in a bounded channel and a
//! full queue is rejected with [`SchedulerError::Backpressure`]. The pump
//! drains the queue into at most `workers` concurrent runs. A run is one or
//! more attempts of the job, each bounded by the job timeout and logged.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tickwork_core::model::{Job, RunStatus};
use tickwork_core::types::{InstanceName, JobId, RunId, TriggerId};
use tickwork_executors::{Executor, ExecutorRegistry, JobContext, Outcome};
use tickwork_listeners::{JobEvent, ListenerBus};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::scanner::Fire;
use crate::store::{NewExecutionLog, Store};

/// A run currently executing on this instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningJob {
    pub run_id: RunId,
    pub job_id: JobId,
    pub job_name: String,
    pub trigger_id: Option<TriggerId>,
    pub fire_at: DateTime<Utc>,
    pub attempt: u32,
    pub manual: bool,
    pub started_at: DateTime<Utc>,
}

/// Submission side of the dispatch queue. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Fire>,
    queue_depth: usize,
    running: Arc<DashMap<RunId, RunningJob>>,
}

impl Dispatcher {
    pub fn new(queue_depth: usize) -> (Self, mpsc::Receiver<Fire>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let dispatcher = Self {
            tx,
            queue_depth,
            running: Arc::new(DashMap::new()),
        };
        (dispatcher, rx)
    }

    pub fn submit(&self, fire: Fire) -> Result<()> {
        self.tx.try_send(fire).map_err(|e| match e {
            TrySendError::Full(fire) => {
                warn!(job_id = %fire.job_id, fire_at = %fire.fire_at, "dispatch queue full, fire rejected");
                SchedulerError::Backpressure {
                    queue_depth: self.queue_depth,
                }
            }
            TrySendError::Closed(_) => SchedulerError::ShuttingDown,
        })
    }

    /// Snapshot of runs in progress, oldest first.
    pub fn running(&self) -> Vec<RunningJob> {
        let mut runs: Vec<RunningJob> = self.running.iter().map(|e| e.value().clone()).collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    pub(crate) fn running_map(&self) -> Arc<DashMap<RunId, RunningJob>> {
        Arc::clone(&self.running)
    }
}

/// Executes fires. Shared by every worker task.
pub struct JobRunner {
    store: Arc<Store>,
    registry: Arc<ExecutorRegistry>,
    bus: Arc<ListenerBus>,
    clock: Arc<dyn Clock>,
    instance_name: InstanceName,
    running: Arc<DashMap<RunId, RunningJob>>,
    /// Runs in progress per job, for the overlap limit.
    overlap: DashMap<JobId, usize>,
    /// Parent of every attempt token; cancelled on shutdown.
    cancel: CancellationToken,
}

/// Holds one slot of a job's overlap count until the run ends.
struct OverlapSlot<'a> {
    counts: &'a DashMap<JobId, usize>,
    job_id: JobId,
}

impl Drop for OverlapSlot<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.job_id) {
            *count = count.saturating_sub(1);
        }
        self.counts.remove_if(&self.job_id, |_, count| *count == 0);
    }
}

impl JobRunner {
    pub fn new(
        dispatcher: &Dispatcher,
        store: Arc<Store>,
        registry: Arc<ExecutorRegistry>,
        bus: Arc<ListenerBus>,
        clock: Arc<dyn Clock>,
        instance_name: InstanceName,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            bus,
            clock,
            instance_name,
            running: dispatcher.running_map(),
            overlap: DashMap::new(),
            cancel,
        }
    }

    /// Take an overlap slot for `job`, or report how many runs already hold
    /// one when its limit is reached.
    fn enter(&self, job: &Job) -> std::result::Result<OverlapSlot<'_>, usize> {
        let mut count = self.overlap.entry(job.id).or_insert(0);
        if let Some(limit) = job.max_overlap() {
            if *count >= limit {
                return Err(*count);
            }
        }
        *count += 1;
        drop(count);
        Ok(OverlapSlot {
            counts: &self.overlap,
            job_id: job.id,
        })
    }

    /// A scheduled fire only runs while its trigger still exists and is
    /// enabled; fires placed on the wheel before a change are dropped here.
    fn trigger_still_live(&self, fire: &Fire) -> bool {
        let Some(trigger_id) = fire.trigger_id.filter(|_| !fire.manual) else {
            return true;
        };
        match self.store.get_trigger(trigger_id) {
            Ok(Some(trigger)) if trigger.enabled => true,
            Ok(Some(_)) => {
                info!(%trigger_id, fire_at = %fire.fire_at, "trigger disabled, fire skipped");
                false
            }
            Ok(None) => {
                info!(%trigger_id, fire_at = %fire.fire_at, "trigger deleted, fire skipped");
                false
            }
            Err(e) => {
                error!(%trigger_id, "loading fired trigger failed: {e}");
                false
            }
        }
    }

    /// Run one fire to completion: every attempt, its log rows, listener
    /// events and the job's bookkeeping.
    pub async fn run_fire(&self, fire: Fire) {
        let job = match self.store.get_job(fire.job_id) {
            Ok(Some(job)) => Arc::new(job),
            Ok(None) => {
                warn!(job_id = %fire.job_id, "fired job no longer exists");
                return;
            }
            Err(e) => {
                error!(job_id = %fire.job_id, "loading fired job failed: {e}");
                return;
            }
        };
        if !job.enabled && !fire.manual {
            info!(job_id = %job.id, "job disabled, fire skipped");
            return;
        }
        if !self.trigger_still_live(&fire) {
            return;
        }

        let run_id = RunId::new();
        let _slot = match self.enter(&job) {
            Ok(slot) => slot,
            Err(in_progress) => {
                let reason = format!(
                    "{in_progress} run(s) already in progress on this instance, overlap limit reached"
                );
                warn!(job_id = %job.id, fire_at = %fire.fire_at, in_progress, "fire skipped");
                let now = self.clock.now();
                self.log_attempt(&job, &fire, run_id, 1, now, now, RunStatus::Skipped, Some(&reason), None);
                return;
            }
        };
        let max_attempts = job.retry.max_attempts.max(1);
        let mut event = JobEvent {
            namespace: job.namespace.clone(),
            run_id,
            job_id: job.id,
            job_name: job.name.clone(),
            kind: job.kind,
            trigger_id: fire.trigger_id,
            fire_at: fire.fire_at,
            attempt: 1,
            max_attempts,
            manual: fire.manual,
            instance_name: self.instance_name.clone(),
        };

        let executor = match self.resolve(&job) {
            Ok(executor) => executor,
            Err(e) => {
                let reason = e.to_string();
                warn!(job_id = %job.id, %reason, "job cannot be executed");
                let now = self.clock.now();
                self.log_attempt(&job, &fire, run_id, 1, now, now, RunStatus::Failed, Some(&reason), None);
                self.bus.emit_job_failed(&event, RunStatus::Failed, &reason);
                self.finish(&job, RunStatus::Failed);
                return;
            }
        };

        let mut final_status = RunStatus::Failed;
        for attempt in 1..=max_attempts {
            event.attempt = attempt;
            let started_at = self.clock.now();
            self.running.insert(
                run_id,
                RunningJob {
                    run_id,
                    job_id: job.id,
                    job_name: job.name.clone(),
                    trigger_id: fire.trigger_id,
                    fire_at: fire.fire_at,
                    attempt,
                    manual: fire.manual,
                    started_at,
                },
            );
            self.bus.emit_job_started(&event);

            let outcome = self.attempt(&executor, &job, &fire, run_id, attempt).await;
            let ended_at = self.clock.now();
            final_status = outcome.status();

            let reason = match &outcome {
                Outcome::Success { output } => {
                    self.log_attempt(&job, &fire, run_id, attempt, started_at, ended_at, final_status, None, output.as_deref());
                    self.bus.emit_job_succeeded(&event, output.as_deref());
                    break;
                }
                Outcome::Failure { reason } => reason.clone(),
                Outcome::Timeout => format!("timed out after {}ms", job.timeout_ms),
            };
            self.log_attempt(&job, &fire, run_id, attempt, started_at, ended_at, final_status, Some(&reason), None);

            if attempt == max_attempts || self.cancel.is_cancelled() {
                self.bus.emit_job_failed(&event, final_status, &reason);
                break;
            }

            self.bus.emit_job_retrying(&event, &reason);
            let delay = job.retry.backoff.delay_after(attempt);
            debug!(job_id = %job.id, attempt, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.bus.emit_job_failed(&event, final_status, "cancelled during retry backoff");
                    break;
                }
            }
        }

        self.running.remove(&run_id);
        self.finish(&job, final_status);
    }

    fn resolve(&self, job: &Job) -> Result<Arc<dyn Executor>> {
        job.validate()?;
        self.registry
            .find(job.kind)
            .ok_or(SchedulerError::NoExecutor(job.kind))
    }

    /// One attempt under the job timeout. Panics become failures; a timeout
    /// cancels the attempt's token so the executor can release resources.
    async fn attempt(
        &self,
        executor: &Arc<dyn Executor>,
        job: &Arc<Job>,
        fire: &Fire,
        run_id: RunId,
        attempt: u32,
    ) -> Outcome {
        let token = self.cancel.child_token();
        let ctx = JobContext {
            job: Arc::clone(job),
            run_id,
            attempt,
            fire_at: fire.fire_at,
            manual: fire.manual,
            instance_name: self.instance_name.clone(),
            cancel: token.clone(),
        };
        // Whatever happens below, the attempt's token ends with it.
        let _guard = token.clone().drop_guard();

        let guarded = AssertUnwindSafe(executor.execute(&ctx)).catch_unwind();
        match tokio::time::timeout(job.timeout(), guarded).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job.id, executor = executor.name(), "executor panicked: {message}");
                Outcome::failure(format!("executor panicked: {message}"))
            }
            Err(_) => {
                token.cancel();
                warn!(job_id = %job.id, timeout_ms = job.timeout_ms, "attempt timed out");
                Outcome::Timeout
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_attempt(
        &self,
        job: &Job,
        fire: &Fire,
        run_id: RunId,
        attempt: u32,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        status: RunStatus,
        error: Option<&str>,
        output: Option<&str>,
    ) {
        let log = NewExecutionLog {
            run_id,
            namespace: &job.namespace,
            job_id: job.id,
            trigger_id: fire.trigger_id,
            fire_at: fire.fire_at,
            attempt,
            instance_name: &self.instance_name,
            started_at,
            ended_at,
            status,
            error,
            output,
        };
        if let Err(e) = self.store.insert_execution_log(&log) {
            error!(job_id = %job.id, %run_id, attempt, "writing execution log failed: {e}");
        }
    }

    fn finish(&self, job: &Job, status: RunStatus) {
        if let Err(e) = self.store.record_job_run(job.id, status, self.clock.now()) {
            error!(job_id = %job.id, "recording job run failed: {e}");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drain the dispatch queue into at most `workers` concurrent runs until
/// shutdown, then wait for runs in flight.
pub async fn run_pump(
    runner: Arc<JobRunner>,
    mut rx: mpsc::Receiver<Fire>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(workers, "dispatch pump started");
    let permits = Arc::new(Semaphore::new(workers));
    let mut runs = JoinSet::new();

    loop {
        tokio::select! {
            fire = rx.recv() => {
                let Some(fire) = fire else { break };
                let permit = match Arc::clone(&permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let runner = Arc::clone(&runner);
                runs.spawn(async move {
                    let _permit = permit;
                    runner.run_fire(fire).await;
                });
            }
            Some(done) = runs.join_next(), if !runs.is_empty() => {
                if let Err(e) = done {
                    error!("run task failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("dispatch pump shutting down");
                    break;
                }
            }
        }
    }

    rx.close();
    while let Some(done) = runs.join_next().await {
        if let Err(e) = done {
            error!("run task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fire(job: i64) -> Fire {
        Fire {
            namespace: "default".to_string(),
            trigger_id: None,
            job_id: JobId(job),
            fire_at: Utc::now(),
            misfire: false,
            manual: true,
        }
    }

    #[test]
    fn full_queue_is_backpressure() {
        let (dispatcher, _rx) = Dispatcher::new(2);
        dispatcher.submit(fire(1)).unwrap();
        dispatcher.submit(fire(2)).unwrap();
        assert!(matches!(
            dispatcher.submit(fire(3)),
            Err(SchedulerError::Backpressure { queue_depth: 2 })
        ));
    }

    #[test]
    fn closed_queue_is_shutting_down() {
        let (dispatcher, rx) = Dispatcher::new(2);
        drop(rx);
        assert!(matches!(dispatcher.submit(fire(1)), Err(SchedulerError::ShuttingDown)));
    }
}
