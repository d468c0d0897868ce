//! Due-trigger scanner.
//!
//! One cycle: take the scan lock, pull due triggers, plan their fires
//! (including misfire handling), persist the new trigger state together with
//! one trigger-log row per occurrence, commit, then place the fires on the
//! timing wheel. The unique `(trigger_id, fire_at)` index on `trigger_logs`
//! backs the at-most-once guarantee even if two scans ever overlapped.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tickwork_core::config::TickworkConfig;
use tickwork_core::model::{MisfirePolicy, Trigger};
use tickwork_core::types::{JobId, TriggerId};
use tickwork_listeners::{ListenerBus, SchedulerEvent, SchedulerEventKind, TriggerEvent};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cluster::{ClusterCoordinator, SCAN_LOCK};
use crate::error::{Result, SchedulerError};
use crate::schedule::{next_after, resume_after, within_window};
use crate::store::{self, DueTrigger, NewTriggerLog};
use crate::wheel::{TimerHandle, WheelTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    AcquiringLock,
    Scanning,
    Dispatching,
}

/// One occurrence handed to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fire {
    pub namespace: String,
    /// `None` for manual runs.
    pub trigger_id: Option<TriggerId>,
    pub job_id: JobId,
    pub fire_at: DateTime<Utc>,
    /// Produced by a misfire policy rather than the regular schedule.
    pub misfire: bool,
    pub manual: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub lookahead: Duration,
    pub misfire_threshold: Duration,
    pub replay_cap: u32,
    pub batch_size: u32,
}

impl ScanSettings {
    pub fn from_config(config: &TickworkConfig) -> Self {
        Self {
            lookahead: Duration::milliseconds(config.scheduler.lookahead_ms as i64),
            misfire_threshold: Duration::milliseconds(config.misfire.threshold_ms as i64),
            replay_cap: config.misfire.replay_cap,
            batch_size: config.scheduler.batch_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedFire {
    pub fire_at: DateTime<Utc>,
    pub misfire: bool,
}

/// What one due trigger turns into during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPlan {
    pub fires: Vec<PlannedFire>,
    /// First missed occurrence dropped by the `ignore` policy.
    pub skipped: Option<DateTime<Utc>>,
    /// Replays dropped because `fire_all_missed` hit its cap.
    pub dropped: u32,
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// Dropped replays are only counted for the log line; stop counting here.
const DROPPED_COUNT_LIMIT: u32 = 10_000;

/// Plan the fires of `trigger` for the window ending at `now + lookahead`.
///
/// At most `budget` regular fires are planned; anything beyond stays in
/// `next_fire_at` for the next cycle. Misfire replays are bounded by the
/// replay cap instead.
pub fn plan_trigger(
    trigger: &Trigger,
    now: DateTime<Utc>,
    settings: &ScanSettings,
    budget: usize,
) -> Result<TriggerPlan> {
    let mut plan = TriggerPlan {
        fires: Vec::new(),
        skipped: None,
        dropped: 0,
        next_fire_at: None,
    };
    let Some(due) = trigger.next_fire_at else {
        return Ok(plan);
    };
    let schedule = &trigger.schedule;
    let mut next = Some(due);

    if due < now - settings.misfire_threshold {
        next = match trigger.misfire_policy {
            MisfirePolicy::Ignore => {
                plan.skipped = Some(due);
                resume_after(schedule, due, now)?
            }
            MisfirePolicy::FireOnceNow => {
                plan.fires.push(PlannedFire {
                    fire_at: now,
                    misfire: true,
                });
                resume_after(schedule, due, now)?
            }
            MisfirePolicy::FireAllMissed { cap } => {
                let cap = cap.unwrap_or(settings.replay_cap);
                let mut cursor = within_window(Some(due), trigger.end_at);
                let mut replayed = 0;
                while let Some(at) = cursor {
                    if at > now || replayed >= cap {
                        break;
                    }
                    plan.fires.push(PlannedFire {
                        fire_at: at,
                        misfire: true,
                    });
                    replayed += 1;
                    cursor = within_window(next_after(schedule, at)?, trigger.end_at);
                }
                match cursor {
                    Some(at) if at <= now => {
                        // Cap reached: count what is left behind, then jump ahead.
                        let mut walk = Some(at);
                        while let Some(w) = walk.filter(|w| *w <= now) {
                            if plan.dropped == DROPPED_COUNT_LIMIT {
                                break;
                            }
                            plan.dropped += 1;
                            walk = next_after(schedule, w)?;
                        }
                        resume_after(schedule, at, now)?
                    }
                    other => other,
                }
            }
        };
    }

    let horizon = now + settings.lookahead;
    let mut regular = 0usize;
    while let Some(at) = within_window(next, trigger.end_at) {
        if at > horizon || regular >= budget {
            break;
        }
        plan.fires.push(PlannedFire {
            fire_at: at,
            misfire: false,
        });
        regular += 1;
        next = next_after(schedule, at)?;
    }
    plan.next_fire_at = within_window(next, trigger.end_at);
    Ok(plan)
}

/// Result of one scan cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Scan skipped: standby instance.
    pub standby: bool,
    /// Scan skipped: another instance holds the scan lock.
    pub lock_busy: bool,
    pub triggers: usize,
    pub fires: usize,
    pub misfires: usize,
    pub invalid: usize,
}

#[derive(Default)]
struct Claimed {
    triggers: usize,
    fires: Vec<(Fire, Option<&'static str>)>,
    misfires: Vec<TriggerEvent>,
    invalid: Vec<(TriggerId, String)>,
}

/// Puts the scanner back to idle however the cycle ends, panics included.
struct IdleOnDrop<'a>(&'a Mutex<ScanState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        let mut state = match self.0.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = ScanState::Idle;
    }
}

/// Wheel handles of fires this instance has scheduled but not yet released,
/// keyed by trigger. Admin changes withdraw them through [`cancel`](Self::cancel).
#[derive(Default)]
pub struct PendingFires {
    handles: DashMap<TriggerId, Vec<TimerHandle>>,
}

impl PendingFires {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, trigger_id: TriggerId, handle: TimerHandle) {
        let mut handles = self.handles.entry(trigger_id).or_default();
        handles.retain(is_pending);
        handles.push(handle);
    }

    /// Cancel every pending fire of `trigger_id`; returns how many were
    /// withdrawn before release.
    pub fn cancel(&self, trigger_id: TriggerId) -> usize {
        self.handles
            .remove(&trigger_id)
            .map(|(_, handles)| handles.iter().filter(|h| h.cancel()).count())
            .unwrap_or(0)
    }

    pub fn pending(&self, trigger_id: TriggerId) -> usize {
        self.handles
            .get(&trigger_id)
            .map(|handles| handles.iter().filter(|h| is_pending(h)).count())
            .unwrap_or(0)
    }

    /// Forget handles that fired or were cancelled.
    fn prune(&self) {
        self.handles.retain(|_, handles| {
            handles.retain(is_pending);
            !handles.is_empty()
        });
    }
}

fn is_pending(handle: &TimerHandle) -> bool {
    !handle.is_expired() && !handle.is_cancelled()
}

pub struct Scanner {
    coordinator: Arc<ClusterCoordinator>,
    clock: Arc<dyn Clock>,
    bus: Arc<ListenerBus>,
    wheel: Arc<WheelTimer<Fire>>,
    settings: ScanSettings,
    pending: Arc<PendingFires>,
    state: Mutex<ScanState>,
}

impl Scanner {
    pub fn new(
        coordinator: Arc<ClusterCoordinator>,
        clock: Arc<dyn Clock>,
        bus: Arc<ListenerBus>,
        wheel: Arc<WheelTimer<Fire>>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            coordinator,
            clock,
            bus,
            wheel,
            settings,
            pending: Arc::new(PendingFires::new()),
            state: Mutex::new(ScanState::Idle),
        }
    }

    /// Share the pending-fire registry with [`Admin`](crate::admin::Admin).
    pub fn with_pending(mut self, pending: Arc<PendingFires>) -> Self {
        self.pending = pending;
        self
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock().expect("scan state poisoned")
    }

    fn set_state(&self, state: ScanState) {
        *self.state.lock().expect("scan state poisoned") = state;
    }

    /// Run one scan cycle.
    pub fn scan_once(&self) -> Result<ScanReport> {
        if self.coordinator.is_standby() {
            return Ok(ScanReport {
                standby: true,
                ..ScanReport::default()
            });
        }

        let _idle = IdleOnDrop(&self.state);
        self.set_state(ScanState::AcquiringLock);
        let now = self.clock.now();
        let locked = self.coordinator.try_acquire_lock(SCAN_LOCK, |tx| {
            self.set_state(ScanState::Scanning);
            self.claim(tx, now)
        });
        let Some(claimed) = locked? else {
            return Ok(ScanReport {
                lock_busy: true,
                ..ScanReport::default()
            });
        };

        self.set_state(ScanState::Dispatching);
        let report = ScanReport {
            standby: false,
            lock_busy: false,
            triggers: claimed.triggers,
            fires: claimed.fires.len(),
            misfires: claimed.misfires.len(),
            invalid: claimed.invalid.len(),
        };
        self.publish(claimed);

        if report.fires > 0 || report.misfires > 0 || report.invalid > 0 {
            debug!(
                triggers = report.triggers,
                fires = report.fires,
                misfires = report.misfires,
                invalid = report.invalid,
                "scan cycle"
            );
        }
        Ok(report)
    }

    /// Everything that must happen inside the scan lock.
    fn claim(&self, conn: &Connection, now: DateTime<Utc>) -> Result<Claimed> {
        let namespace = self.coordinator.namespace();
        let instance = self.coordinator.instance_name();
        let horizon = now + self.settings.lookahead;
        let due = store::due_triggers(conn, namespace, horizon, self.settings.batch_size)?;

        let mut claimed = Claimed {
            triggers: due.len(),
            ..Claimed::default()
        };
        let mut budget = self.settings.batch_size as usize;

        for row in due {
            if budget == 0 {
                break;
            }
            let trigger = match row {
                DueTrigger::Ready(trigger) => trigger,
                DueTrigger::Undecodable { id, reason } => {
                    warn!(trigger_id = %id, %reason, "trigger row unreadable");
                    store::invalidate_trigger(conn, id, &reason, now)?;
                    claimed.invalid.push((id, reason));
                    continue;
                }
            };
            let plan = match plan_trigger(&trigger, now, &self.settings, budget) {
                Ok(plan) => plan,
                Err(SchedulerError::InvalidSchedule(reason)) => {
                    warn!(trigger_id = %trigger.id, %reason, "trigger schedule unusable");
                    store::invalidate_trigger(conn, trigger.id, &reason, now)?;
                    claimed.invalid.push((trigger.id, reason));
                    continue;
                }
                Err(e) => return Err(e),
            };
            let policy = trigger.misfire_policy.as_str();

            if let Some(skipped_at) = plan.skipped {
                let note = format!("skipped by {policy}");
                let log = NewTriggerLog {
                    namespace,
                    trigger_id: Some(trigger.id),
                    job_id: trigger.job_id,
                    instance_name: instance,
                    fire_at: skipped_at,
                    fired_at: now,
                    misfired: true,
                    manual: false,
                    note: Some(&note),
                };
                if store::insert_trigger_log(conn, &log)? {
                    claimed.misfires.push(self.trigger_event(&trigger, skipped_at, Some(note)));
                }
            }
            if plan.dropped > 0 {
                info!(
                    trigger_id = %trigger.id,
                    dropped = plan.dropped,
                    "misfire replay cap reached"
                );
            }

            let mut fired = 0u64;
            let mut last_fire_at = None;
            for planned in &plan.fires {
                let note = planned.misfire.then_some(policy);
                let log = NewTriggerLog {
                    namespace,
                    trigger_id: Some(trigger.id),
                    job_id: trigger.job_id,
                    instance_name: instance,
                    fire_at: planned.fire_at,
                    fired_at: now,
                    misfired: planned.misfire,
                    manual: false,
                    note,
                };
                last_fire_at = Some(planned.fire_at);
                if !store::insert_trigger_log(conn, &log)? {
                    debug!(trigger_id = %trigger.id, fire_at = %planned.fire_at, "occurrence already claimed");
                    continue;
                }
                fired += 1;
                budget = budget.saturating_sub(1);
                claimed.fires.push((
                    Fire {
                        namespace: namespace.to_string(),
                        trigger_id: Some(trigger.id),
                        job_id: trigger.job_id,
                        fire_at: planned.fire_at,
                        misfire: planned.misfire,
                        manual: false,
                    },
                    note,
                ));
            }

            store::advance_trigger(conn, trigger.id, plan.next_fire_at, last_fire_at, fired, now)?;
            if plan.next_fire_at.is_none() {
                debug!(trigger_id = %trigger.id, "trigger exhausted");
            }
        }
        Ok(claimed)
    }

    fn trigger_event(&self, trigger: &Trigger, fire_at: DateTime<Utc>, note: Option<String>) -> TriggerEvent {
        TriggerEvent {
            namespace: trigger.namespace.clone(),
            trigger_id: trigger.id,
            job_id: trigger.job_id,
            fire_at,
            instance_name: self.coordinator.instance_name().clone(),
            note,
        }
    }

    /// After commit: notify listeners and hand fires to the wheel.
    fn publish(&self, claimed: Claimed) {
        for event in &claimed.misfires {
            self.bus.emit_trigger_misfired(event);
        }
        for (trigger_id, reason) in claimed.invalid {
            self.bus.emit_scheduler(&SchedulerEvent::new(
                self.coordinator.namespace(),
                self.coordinator.instance_name().clone(),
                SchedulerEventKind::Error {
                    context: format!("trigger {trigger_id}"),
                    message: reason,
                },
            ));
        }

        self.pending.prune();
        let now = self.clock.now();
        for (fire, note) in claimed.fires {
            let Some(trigger_id) = fire.trigger_id else {
                continue;
            };
            let event = TriggerEvent {
                namespace: fire.namespace.clone(),
                trigger_id,
                job_id: fire.job_id,
                fire_at: fire.fire_at,
                instance_name: self.coordinator.instance_name().clone(),
                note: note.map(str::to_string),
            };
            if fire.misfire {
                self.bus.emit_trigger_misfired(&event);
            }
            self.bus.emit_trigger_fired(&event);

            let delay = (fire.fire_at - now).to_std().unwrap_or(StdDuration::ZERO);
            let handle = self.wheel.schedule(fire, delay);
            self.pending.track(trigger_id, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tickwork_core::model::Schedule;

    fn t(s: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap() + Duration::seconds(s)
    }

    fn settings() -> ScanSettings {
        ScanSettings {
            lookahead: Duration::seconds(5),
            misfire_threshold: Duration::seconds(5),
            replay_cap: 3,
            batch_size: 100,
        }
    }

    fn trigger(schedule: Schedule, next: DateTime<Utc>, policy: MisfirePolicy) -> Trigger {
        Trigger {
            id: TriggerId(1),
            namespace: "default".to_string(),
            job_id: JobId(1),
            name: "t".to_string(),
            schedule,
            misfire_policy: policy,
            start_at: None,
            end_at: None,
            next_fire_at: Some(next),
            last_fire_at: None,
            enabled: true,
            fire_count: 0,
            last_error: None,
            created_at: t(-1000),
            updated_at: t(-1000),
        }
    }

    fn every(secs: u64) -> Schedule {
        Schedule::FixedInterval {
            every_ms: secs * 1_000,
        }
    }

    fn fire_times(plan: &TriggerPlan) -> Vec<DateTime<Utc>> {
        plan.fires.iter().map(|f| f.fire_at).collect()
    }

    #[test]
    fn plans_every_occurrence_inside_lookahead() {
        let plan = plan_trigger(&trigger(every(1), t(1), MisfirePolicy::Ignore), t(0), &settings(), 100)
            .unwrap();
        assert_eq!(fire_times(&plan), vec![t(1), t(2), t(3), t(4), t(5)]);
        assert_eq!(plan.next_fire_at, Some(t(6)));
    }

    #[test]
    fn budget_limits_regular_fires() {
        let plan = plan_trigger(&trigger(every(1), t(1), MisfirePolicy::Ignore), t(0), &settings(), 2)
            .unwrap();
        assert_eq!(fire_times(&plan), vec![t(1), t(2)]);
        assert_eq!(plan.next_fire_at, Some(t(3)));
    }

    #[test]
    fn small_delay_is_not_a_misfire() {
        let plan = plan_trigger(&trigger(every(10), t(-3), MisfirePolicy::Ignore), t(0), &settings(), 100)
            .unwrap();
        assert_eq!(fire_times(&plan), vec![t(-3)]);
        assert!(plan.skipped.is_none());
        assert_eq!(plan.next_fire_at, Some(t(7)));
    }

    #[test]
    fn ignore_skips_to_the_grid_after_now() {
        let plan = plan_trigger(&trigger(every(10), t(-60), MisfirePolicy::Ignore), t(0), &settings(), 100)
            .unwrap();
        assert_eq!(plan.skipped, Some(t(-60)));
        assert!(plan.fires.is_empty());
        assert_eq!(plan.next_fire_at, Some(t(10)));
    }

    #[test]
    fn fire_once_now_fires_once_then_resumes() {
        let plan = plan_trigger(
            &trigger(every(10), t(-60), MisfirePolicy::FireOnceNow),
            t(0),
            &settings(),
            100,
        )
        .unwrap();
        assert_eq!(plan.fires, vec![PlannedFire { fire_at: t(0), misfire: true }]);
        assert_eq!(plan.next_fire_at, Some(t(10)));
    }

    #[test]
    fn fire_all_missed_replays_up_to_cap() {
        let plan = plan_trigger(
            &trigger(every(10), t(-60), MisfirePolicy::FireAllMissed { cap: None }),
            t(0),
            &settings(),
            100,
        )
        .unwrap();
        // Cap 3 from settings; -30..=0 are dropped.
        assert_eq!(fire_times(&plan), vec![t(-60), t(-50), t(-40)]);
        assert!(plan.fires.iter().all(|f| f.misfire));
        assert_eq!(plan.dropped, 4);
        assert_eq!(plan.next_fire_at, Some(t(10)));
    }

    #[test]
    fn fire_all_missed_per_trigger_cap_wins() {
        let plan = plan_trigger(
            &trigger(every(10), t(-30), MisfirePolicy::FireAllMissed { cap: Some(50) }),
            t(0),
            &settings(),
            100,
        )
        .unwrap();
        assert_eq!(fire_times(&plan), vec![t(-30), t(-20), t(-10), t(0)]);
        assert_eq!(plan.dropped, 0);
        assert_eq!(plan.next_fire_at, Some(t(10)));
    }

    #[test]
    fn once_schedule_exhausts() {
        let plan = plan_trigger(
            &trigger(Schedule::Once { at: t(2) }, t(2), MisfirePolicy::Ignore),
            t(0),
            &settings(),
            100,
        )
        .unwrap();
        assert_eq!(fire_times(&plan), vec![t(2)]);
        assert_eq!(plan.next_fire_at, None);
    }

    #[test]
    fn end_at_exhausts_inside_window() {
        let mut tr = trigger(every(1), t(1), MisfirePolicy::Ignore);
        tr.end_at = Some(t(3));
        let plan = plan_trigger(&tr, t(0), &settings(), 100).unwrap();
        assert_eq!(fire_times(&plan), vec![t(1), t(2), t(3)]);
        assert_eq!(plan.next_fire_at, None);
    }

    #[test]
    fn malformed_cron_is_reported() {
        let tr = trigger(
            Schedule::Cron {
                expression: "bogus".to_string(),
            },
            t(1),
            MisfirePolicy::Ignore,
        );
        assert!(matches!(
            plan_trigger(&tr, t(0), &settings(), 100),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }
}
