mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{coordinator, epoch, procedure_job};
use tickwork_core::model::{
    ExecutionLog, JobPatch, MisfirePolicy, NewTrigger, RunStatus, Schedule,
};
use tickwork_core::types::{InstanceName, JobId, RunId};
use tickwork_scheduler::store::NewExecutionLog;
use tickwork_scheduler::{
    Admin, Dispatcher, Fire, ManualClock, SchedulerError, Store, TriggerLogQuery, TriggerPatch,
};
use tokio::sync::mpsc;

struct Fixture {
    admin: Admin,
    store: Arc<Store>,
    clock: Arc<ManualClock>,
    queue: mpsc::Receiver<Fire>,
}

fn fixture() -> Fixture {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(epoch()));
    let (dispatcher, queue) = Dispatcher::new(4);
    let admin = Admin::new(
        Arc::clone(&store),
        clock.clone(),
        coordinator(Arc::clone(&store), Arc::clone(&clock), "admin", 1_000),
        dispatcher,
    );
    Fixture {
        admin,
        store,
        clock,
        queue,
    }
}

fn every(ms: u64) -> Schedule {
    Schedule::FixedInterval { every_ms: ms }
}

#[test]
fn trigger_creation_computes_first_fire() {
    let f = fixture();
    let job = f.admin.create_job(procedure_job("report")).unwrap();
    let trigger = f
        .admin
        .create_trigger(NewTrigger::new(job.id, "hourly", every(3_600_000)))
        .unwrap();
    assert_eq!(trigger.next_fire_at, Some(epoch() + ChronoDuration::hours(1)));

    let cron = f
        .admin
        .create_trigger(NewTrigger::new(
            job.id,
            "top-of-minute",
            Schedule::Cron {
                expression: "0 * * * * *".to_string(),
            },
        ))
        .unwrap();
    // epoch() sits on a minute boundary, so it is its own first occurrence.
    assert_eq!(cron.next_fire_at, Some(epoch()));
}

#[test]
fn invalid_definitions_are_rejected() {
    let f = fixture();
    let job = f.admin.create_job(procedure_job("report")).unwrap();

    let err = f
        .admin
        .create_trigger(NewTrigger::new(
            job.id,
            "bad",
            Schedule::Cron {
                expression: "every tuesday".to_string(),
            },
        ))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

    let err = f
        .admin
        .create_trigger(NewTrigger::new(job.id, "zero", every(0)))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidJob(_)));

    let err = f
        .admin
        .create_trigger(NewTrigger::new(JobId(999), "orphan", every(1_000)))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound { .. }));

    let mut foreign = procedure_job("elsewhere");
    foreign.namespace = "billing".to_string();
    assert!(matches!(
        f.admin.create_job(foreign),
        Err(SchedulerError::InvalidJob(_))
    ));
}

#[test]
fn enabling_a_job_reschedules_its_triggers_from_now() {
    let f = fixture();
    let job = f.admin.create_job(procedure_job("report")).unwrap();
    let trigger = f
        .admin
        .create_trigger(
            NewTrigger::new(job.id, "minutely", every(60_000))
                .with_misfire_policy(MisfirePolicy::FireAllMissed { cap: None }),
        )
        .unwrap();

    f.admin.disable_job(job.id).unwrap();
    f.clock.advance(Duration::from_secs(3_600));
    let job = f.admin.enable_job(job.id).unwrap();
    assert!(job.enabled);

    let trigger = f.admin.get_trigger(trigger.id).unwrap();
    assert_eq!(
        trigger.next_fire_at,
        Some(epoch() + ChronoDuration::seconds(3_600 + 60))
    );
}

#[test]
fn trigger_patch_reschedules_and_clears_window() {
    let f = fixture();
    let job = f.admin.create_job(procedure_job("report")).unwrap();
    let trigger = f
        .admin
        .create_trigger(
            NewTrigger::new(job.id, "windowed", every(1_000))
                .with_window(None, Some(epoch() + ChronoDuration::milliseconds(500))),
        )
        .unwrap();
    assert_eq!(trigger.next_fire_at, None);

    let trigger = f
        .admin
        .update_trigger(
            trigger.id,
            TriggerPatch {
                end_at: Some(None),
                ..TriggerPatch::default()
            },
        )
        .unwrap();
    assert_eq!(trigger.end_at, None);
    assert_eq!(trigger.next_fire_at, Some(epoch() + ChronoDuration::seconds(1)));

    let renamed = f
        .admin
        .update_trigger(
            trigger.id,
            TriggerPatch {
                name: Some("renamed".to_string()),
                ..TriggerPatch::default()
            },
        )
        .unwrap();
    assert_eq!(renamed.name, "renamed");
    assert_eq!(renamed.next_fire_at, trigger.next_fire_at);
}

#[test]
fn disabled_trigger_is_not_upcoming() {
    let f = fixture();
    let job = f.admin.create_job(procedure_job("report")).unwrap();
    let trigger = f
        .admin
        .create_trigger(NewTrigger::new(job.id, "t", every(1_000)))
        .unwrap();
    assert_eq!(f.admin.stats().unwrap().upcoming.len(), 1);

    f.admin.disable_trigger(trigger.id).unwrap();
    assert!(f.admin.stats().unwrap().upcoming.is_empty());

    f.clock.advance(Duration::from_secs(10));
    let trigger = f.admin.enable_trigger(trigger.id).unwrap();
    assert_eq!(trigger.next_fire_at, Some(epoch() + ChronoDuration::seconds(11)));
}

#[test]
fn run_now_dispatches_manual_fire_for_disabled_job() {
    let mut f = fixture();
    let job = f.admin.create_job(procedure_job("adhoc").disabled()).unwrap();

    let receipt = f.admin.run_now(job.id).unwrap();
    assert_eq!(receipt.fire_at, epoch());

    let fire = f.queue.try_recv().unwrap();
    assert!(fire.manual);
    assert_eq!(fire.trigger_id, None);
    assert_eq!(fire.job_id, job.id);

    let logs = f
        .admin
        .trigger_logs(&TriggerLogQuery {
            job_id: Some(job.id),
            ..TriggerLogQuery::default()
        })
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].id, receipt.trigger_log_id);
    assert!(logs[0].manual);
}

#[test]
fn run_now_reports_backpressure() {
    let f = fixture();
    let job = f.admin.create_job(procedure_job("adhoc")).unwrap();
    for _ in 0..4 {
        f.admin.run_now(job.id).unwrap();
    }
    assert!(matches!(
        f.admin.run_now(job.id),
        Err(SchedulerError::Backpressure { queue_depth: 4 })
    ));
}

#[test]
fn deleting_a_job_keeps_its_history() {
    let f = fixture();
    let job = f.admin.create_job(procedure_job("gone")).unwrap();
    f.admin
        .create_trigger(NewTrigger::new(job.id, "t", every(1_000)))
        .unwrap();
    let instance = InstanceName::from("admin");
    f.store
        .insert_execution_log(&NewExecutionLog {
            run_id: RunId::new(),
            namespace: "default",
            job_id: job.id,
            trigger_id: None,
            fire_at: epoch(),
            attempt: 1,
            instance_name: &instance,
            started_at: epoch(),
            ended_at: epoch(),
            status: RunStatus::Failed,
            error: Some("x"),
            output: None,
        })
        .unwrap();

    f.admin.delete_job(job.id).unwrap();
    assert!(f.admin.list_triggers(Some(job.id)).unwrap().is_empty());
    let history: Vec<ExecutionLog> = f.admin.execution_logs(&Default::default()).unwrap();
    assert_eq!(history.len(), 1);

    let ranking = f.admin.stats().unwrap().error_ranking;
    assert_eq!(ranking[0].failures, 1);
    assert_eq!(ranking[0].job_name, format!("#{}", job.id));
}

#[test]
fn update_job_validates_patched_fields() {
    let f = fixture();
    let job = f.admin.create_job(procedure_job("patched")).unwrap();
    let updated = f
        .admin
        .update_job(
            job.id,
            JobPatch {
                timeout_ms: Some(5_000),
                description: Some("nightly".to_string()),
                ..JobPatch::default()
            },
        )
        .unwrap();
    assert_eq!(updated.timeout_ms, 5_000);
    assert_eq!(updated.description.as_deref(), Some("nightly"));

    let err = f
        .admin
        .update_job(
            job.id,
            JobPatch {
                timeout_ms: Some(0),
                ..JobPatch::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidJob(_)));
}

#[test]
fn concurrency_settings_persist() {
    let f = fixture();
    let job = f
        .admin
        .create_job(procedure_job("singleton").exclusive())
        .unwrap();
    let stored = f.admin.get_job(job.id).unwrap();
    assert!(!stored.allow_concurrent);
    assert_eq!(stored.max_overlap(), Some(1));

    let updated = f
        .admin
        .update_job(
            job.id,
            JobPatch {
                allow_concurrent: Some(true),
                max_reentry: Some(Some(2)),
                ..JobPatch::default()
            },
        )
        .unwrap();
    assert!(updated.allow_concurrent);
    assert_eq!(updated.max_reentry, Some(2));
    assert_eq!(updated.max_overlap(), Some(3));
}
