//! Administrative API: job and trigger management, manual runs, log queries
//! and statistics for one namespace.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tickwork_core::model::{
    ExecutionLog, Job, JobKind, JobPatch, MisfirePolicy, NewJob, NewTrigger, Schedule,
    SchedulerLogEntry, Trigger, TriggerLog,
};
use tickwork_core::types::{JobId, TriggerId};
use tracing::info;

use crate::clock::Clock;
use crate::cluster::{ClusterCoordinator, InstanceStatus, SCAN_LOCK};
use crate::dispatch::{Dispatcher, RunningJob};
use crate::error::{Result, SchedulerError};
use crate::scanner::{Fire, PendingFires};
use crate::schedule;
use crate::store::{self, ExecutionLogQuery, JobErrorCount, NewTriggerLog, Store, TriggerLogQuery};

const STATS_ERROR_WINDOW_HOURS: i64 = 24;
const STATS_LIMIT: u32 = 10;

/// Partial trigger update. `None` leaves a field unchanged; the window
/// fields use a nested `Option` so they can be cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerPatch {
    pub name: Option<String>,
    pub schedule: Option<Schedule>,
    pub misfire_policy: Option<MisfirePolicy>,
    pub start_at: Option<Option<DateTime<Utc>>>,
    pub end_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpcomingFire {
    pub trigger_id: TriggerId,
    pub trigger_name: String,
    pub job_id: JobId,
    pub next_fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub jobs_by_kind: Vec<(JobKind, u64)>,
    /// Failed or timed-out attempts over the last day, worst first.
    pub error_ranking: Vec<JobErrorCount>,
    /// Runs executing on this instance.
    pub running: Vec<RunningJob>,
    pub upcoming: Vec<UpcomingFire>,
    pub instances: Vec<InstanceStatus>,
}

/// Receipt for a manual run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualRun {
    pub job_id: JobId,
    pub trigger_log_id: i64,
    pub fire_at: DateTime<Utc>,
}

pub struct Admin {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    coordinator: Arc<ClusterCoordinator>,
    dispatcher: Dispatcher,
    pending: Arc<PendingFires>,
}

impl Admin {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        coordinator: Arc<ClusterCoordinator>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            clock,
            coordinator,
            dispatcher,
            pending: Arc::new(PendingFires::new()),
        }
    }

    /// Share the scanner's pending-fire registry so trigger changes withdraw
    /// fires already on this instance's wheel.
    pub fn with_pending_fires(mut self, pending: Arc<PendingFires>) -> Self {
        self.pending = pending;
        self
    }

    pub fn namespace(&self) -> &str {
        self.coordinator.namespace()
    }

    // -- jobs ----------------------------------------------------------------

    pub fn create_job(&self, job: NewJob) -> Result<Job> {
        if job.namespace != self.namespace() {
            return Err(SchedulerError::InvalidJob(format!(
                "job namespace {:?} does not match scheduler namespace {:?}",
                job.namespace,
                self.namespace()
            )));
        }
        self.store.insert_job(&job, self.clock.now())
    }

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        self.load_job(id)
    }

    pub fn find_job(&self, name: &str) -> Result<Option<Job>> {
        self.store.find_job(self.namespace(), name)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store.list_jobs(self.namespace())
    }

    pub fn update_job(&self, id: JobId, patch: JobPatch) -> Result<Job> {
        let mut job = self.load_job(id)?;
        let was_enabled = job.enabled;
        patch.apply(&mut job);
        let now = self.clock.now();
        self.store.update_job(&job, now)?;
        if job.enabled && !was_enabled {
            self.reschedule_job_triggers(id, now)?;
        }
        self.load_job(id)
    }

    /// Delete a job and its triggers. Its logs are kept until retention.
    pub fn delete_job(&self, id: JobId) -> Result<()> {
        self.load_job(id)?;
        let triggers = self.store.list_triggers(self.namespace(), Some(id))?;
        self.store.delete_job(id)?;
        for trigger in triggers {
            self.withdraw(trigger.id);
        }
        Ok(())
    }

    /// Enabling recomputes every trigger of the job from now, so time spent
    /// disabled does not come back as misfires.
    pub fn enable_job(&self, id: JobId) -> Result<Job> {
        self.update_job(
            id,
            JobPatch {
                enabled: Some(true),
                ..JobPatch::default()
            },
        )
    }

    pub fn disable_job(&self, id: JobId) -> Result<Job> {
        self.update_job(
            id,
            JobPatch {
                enabled: Some(false),
                ..JobPatch::default()
            },
        )
    }

    fn load_job(&self, id: JobId) -> Result<Job> {
        match self.store.get_job(id)? {
            Some(job) if job.namespace == self.namespace() => Ok(job),
            _ => Err(SchedulerError::JobNotFound { id }),
        }
    }

    // -- triggers ------------------------------------------------------------

    pub fn create_trigger(&self, trigger: NewTrigger) -> Result<Trigger> {
        trigger.validate()?;
        schedule::validate(&trigger.schedule)?;
        self.load_job(trigger.job_id)?;
        let now = self.clock.now();
        let next = schedule::first_fire(&trigger.schedule, trigger.start_at, trigger.end_at, now)?;
        self.store.insert_trigger(self.namespace(), &trigger, next, now)
    }

    pub fn get_trigger(&self, id: TriggerId) -> Result<Trigger> {
        self.load_trigger(id)
    }

    pub fn list_triggers(&self, job_id: Option<JobId>) -> Result<Vec<Trigger>> {
        self.store.list_triggers(self.namespace(), job_id)
    }

    /// Apply `patch`. A new schedule or window recomputes the next fire time
    /// from now and clears any previous schedule error.
    pub fn update_trigger(&self, id: TriggerId, patch: TriggerPatch) -> Result<Trigger> {
        let reschedule = patch.schedule.is_some() || patch.start_at.is_some() || patch.end_at.is_some();
        let now = self.clock.now();
        let trigger = self.mutate_trigger(id, now, |trigger| {
            if let Some(name) = patch.name {
                trigger.name = name;
            }
            if let Some(schedule) = patch.schedule {
                trigger.schedule = schedule;
            }
            if let Some(policy) = patch.misfire_policy {
                trigger.misfire_policy = policy;
            }
            if let Some(start_at) = patch.start_at {
                trigger.start_at = start_at;
            }
            if let Some(end_at) = patch.end_at {
                trigger.end_at = end_at;
            }

            let check = NewTrigger {
                job_id: trigger.job_id,
                name: trigger.name.clone(),
                schedule: trigger.schedule.clone(),
                misfire_policy: trigger.misfire_policy,
                start_at: trigger.start_at,
                end_at: trigger.end_at,
                enabled: trigger.enabled,
            };
            check.validate()?;
            schedule::validate(&trigger.schedule)?;
            if reschedule {
                self.recompute(trigger, now)?;
            }
            Ok(())
        })?;
        if reschedule {
            self.withdraw(id);
        }
        Ok(trigger)
    }

    pub fn delete_trigger(&self, id: TriggerId) -> Result<()> {
        self.load_trigger(id)?;
        self.store.delete_trigger(id)?;
        self.withdraw(id);
        Ok(())
    }

    pub fn enable_trigger(&self, id: TriggerId) -> Result<Trigger> {
        let now = self.clock.now();
        let trigger = self.mutate_trigger(id, now, |trigger| {
            trigger.enabled = true;
            self.recompute(trigger, now)
        })?;
        self.withdraw(id);
        info!(trigger_id = %id, next_fire_at = ?trigger.next_fire_at, "trigger enabled");
        Ok(trigger)
    }

    pub fn disable_trigger(&self, id: TriggerId) -> Result<Trigger> {
        let trigger = self.mutate_trigger(id, self.clock.now(), |trigger| {
            trigger.enabled = false;
            Ok(())
        })?;
        self.withdraw(id);
        info!(trigger_id = %id, "trigger disabled");
        Ok(trigger)
    }

    /// Read, change and write one trigger inside the scan lock, so the write
    /// never lands on top of a concurrent scan's advance.
    fn mutate_trigger(
        &self,
        id: TriggerId,
        now: DateTime<Utc>,
        change: impl FnOnce(&mut Trigger) -> Result<()>,
    ) -> Result<Trigger> {
        let namespace = self.namespace();
        let written = self.coordinator.try_acquire_lock(SCAN_LOCK, |tx| {
            let mut trigger = match store::get_trigger_on(tx, id)? {
                Some(trigger) if trigger.namespace == namespace => trigger,
                _ => return Err(SchedulerError::TriggerNotFound { id }),
            };
            change(&mut trigger)?;
            store::update_trigger_on(tx, &trigger, now)?;
            store::get_trigger_on(tx, id)?.ok_or(SchedulerError::TriggerNotFound { id })
        })?;
        written.ok_or(SchedulerError::LockBusy(SCAN_LOCK))
    }

    /// Cancel fires of `id` still waiting on this instance's wheel.
    fn withdraw(&self, id: TriggerId) {
        let cancelled = self.pending.cancel(id);
        if cancelled > 0 {
            info!(trigger_id = %id, cancelled, "pending fires withdrawn");
        }
    }

    fn load_trigger(&self, id: TriggerId) -> Result<Trigger> {
        match self.store.get_trigger(id)? {
            Some(trigger) if trigger.namespace == self.namespace() => Ok(trigger),
            _ => Err(SchedulerError::TriggerNotFound { id }),
        }
    }

    /// Reset the next fire time from `now`. An unusable schedule parks the
    /// trigger with `last_error` instead of failing the call.
    fn recompute(&self, trigger: &mut Trigger, now: DateTime<Utc>) -> Result<()> {
        match schedule::first_fire(&trigger.schedule, trigger.start_at, trigger.end_at, now) {
            Ok(next) => {
                trigger.next_fire_at = next;
                trigger.last_error = None;
            }
            Err(SchedulerError::InvalidSchedule(reason)) => {
                trigger.next_fire_at = None;
                trigger.last_error = Some(reason);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn reschedule_job_triggers(&self, job_id: JobId, now: DateTime<Utc>) -> Result<()> {
        for trigger in self.store.list_triggers(self.namespace(), Some(job_id))? {
            if !trigger.enabled {
                continue;
            }
            self.mutate_trigger(trigger.id, now, |trigger| self.recompute(trigger, now))?;
            self.withdraw(trigger.id);
        }
        Ok(())
    }

    // -- manual runs ---------------------------------------------------------

    /// Fire `job_id` now on this instance, bypassing triggers and the wheel.
    /// Works for disabled jobs too.
    pub fn run_now(&self, job_id: JobId) -> Result<ManualRun> {
        let job = self.load_job(job_id)?;
        let now = self.clock.now();
        let instance = self.coordinator.instance_name();
        let trigger_log_id = self
            .store
            .insert_trigger_log(&NewTriggerLog {
                namespace: &job.namespace,
                trigger_id: None,
                job_id,
                instance_name: instance,
                fire_at: now,
                fired_at: now,
                misfired: false,
                manual: true,
                note: Some("run now"),
            })?
            .ok_or_else(|| SchedulerError::Corrupt("manual trigger log was not written".into()))?;

        self.dispatcher.submit(Fire {
            namespace: job.namespace.clone(),
            trigger_id: None,
            job_id,
            fire_at: now,
            misfire: false,
            manual: true,
        })?;
        info!(job_id = %job_id, "manual run dispatched");
        Ok(ManualRun {
            job_id,
            trigger_log_id,
            fire_at: now,
        })
    }

    // -- logs ----------------------------------------------------------------

    pub fn execution_logs(&self, query: &ExecutionLogQuery) -> Result<Vec<ExecutionLog>> {
        self.store.query_execution_logs(self.namespace(), query)
    }

    pub fn trigger_logs(&self, query: &TriggerLogQuery) -> Result<Vec<TriggerLog>> {
        self.store.query_trigger_logs(self.namespace(), query)
    }

    pub fn scheduler_logs(&self, limit: u32) -> Result<Vec<SchedulerLogEntry>> {
        self.store.scheduler_logs(self.namespace(), limit)
    }

    // -- statistics ----------------------------------------------------------

    pub fn running(&self) -> Vec<RunningJob> {
        self.dispatcher.running()
    }

    pub fn instances(&self) -> Result<Vec<InstanceStatus>> {
        self.coordinator.instances()
    }

    pub fn stats(&self) -> Result<SchedulerStats> {
        let now = self.clock.now();
        let since = now - Duration::hours(STATS_ERROR_WINDOW_HOURS);
        let upcoming = self
            .store
            .upcoming_triggers(self.namespace(), STATS_LIMIT)?
            .into_iter()
            .filter_map(|t| {
                t.next_fire_at.map(|next_fire_at| UpcomingFire {
                    trigger_id: t.id,
                    trigger_name: t.name,
                    job_id: t.job_id,
                    next_fire_at,
                })
            })
            .collect();

        Ok(SchedulerStats {
            jobs_by_kind: self.store.count_jobs_by_kind(self.namespace())?,
            error_ranking: self.store.error_ranking(self.namespace(), since, STATS_LIMIT)?,
            running: self.dispatcher.running(),
            upcoming,
            instances: self.coordinator.instances()?,
        })
    }
}
