//! Instance registry, heartbeats and named cluster locks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Transaction;
use serde::{Deserialize, Serialize};
use tickwork_core::config::SchedulerConfig;
use tickwork_core::model::SchedulerInstance;
use tickwork_core::types::InstanceName;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::store::Store;

/// Guards the due-trigger scan.
pub const SCAN_LOCK: &str = "trigger_scan";
/// Guards log retention.
pub const PURGE_LOCK: &str = "log_purge";

/// A registry row with its computed liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(flatten)]
    pub instance: SchedulerInstance,
    pub alive: bool,
}

pub struct ClusterCoordinator {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    namespace: String,
    instance_name: InstanceName,
    heartbeat_interval: Duration,
    dead_after_heartbeats: u32,
    lock_wait: Duration,
    load_weight: f64,
    standby: bool,
    started_at: DateTime<Utc>,
}

impl ClusterCoordinator {
    pub fn new(
        config: &SchedulerConfig,
        instance_name: InstanceName,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_at = clock.now();
        Self {
            store,
            clock,
            namespace: config.namespace.clone(),
            instance_name,
            heartbeat_interval: config.heartbeat_interval(),
            dead_after_heartbeats: config.dead_after_heartbeats,
            lock_wait: config.lock_wait(),
            load_weight: config.load_weight,
            standby: config.standby,
            started_at,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn instance_name(&self) -> &InstanceName {
        &self.instance_name
    }

    pub fn is_standby(&self) -> bool {
        self.standby
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    fn row(&self, now: DateTime<Utc>) -> SchedulerInstance {
        SchedulerInstance {
            namespace: self.namespace.clone(),
            instance_name: self.instance_name.clone(),
            last_heartbeat_at: now,
            heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
            load_weight: self.load_weight,
            standby: self.standby,
            started_at: self.started_at,
        }
    }

    pub fn register(&self) -> Result<()> {
        self.store.upsert_instance(&self.row(self.clock.now()))?;
        info!(
            namespace = %self.namespace,
            instance = %self.instance_name,
            standby = self.standby,
            "instance registered"
        );
        Ok(())
    }

    /// Refresh this instance's heartbeat, re-registering if another process
    /// removed the row.
    pub fn heartbeat(&self) -> Result<()> {
        let now = self.clock.now();
        if !self.store.touch_instance(&self.namespace, &self.instance_name, now)? {
            warn!(instance = %self.instance_name, "instance row missing, re-registering");
            self.store.upsert_instance(&self.row(now))?;
        }
        debug!(instance = %self.instance_name, "heartbeat");
        Ok(())
    }

    pub fn deregister(&self) -> Result<()> {
        self.store.delete_instance(&self.namespace, &self.instance_name)?;
        info!(instance = %self.instance_name, "instance deregistered");
        Ok(())
    }

    /// Run `work` under the cluster lock `name`. `Ok(None)` means another
    /// instance holds it and this cycle should be skipped.
    pub fn try_acquire_lock<T>(
        &self,
        name: &str,
        work: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        self.store.with_lock(
            &self.namespace,
            name,
            &self.instance_name,
            self.clock.now(),
            self.lock_wait,
            work,
        )
    }

    /// Liveness as seen from this instance's clock. Advisory: a dead
    /// instance keeps whatever it was doing, nothing is revoked.
    pub fn is_alive(&self, instance: &SchedulerInstance) -> bool {
        let silent = (self.clock.now() - instance.last_heartbeat_at).num_milliseconds();
        let limit = self.dead_after_heartbeats as i64 * instance.heartbeat_interval_ms as i64;
        silent <= limit
    }

    pub fn instances(&self) -> Result<Vec<InstanceStatus>> {
        let rows = self.store.list_instances(&self.namespace)?;
        Ok(rows
            .into_iter()
            .map(|instance| InstanceStatus {
                alive: self.is_alive(&instance),
                instance,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn coordinator(store: Arc<Store>, clock: Arc<ManualClock>, name: &str) -> ClusterCoordinator {
        let config = SchedulerConfig {
            heartbeat_interval_ms: 1_000,
            dead_after_heartbeats: 3,
            ..SchedulerConfig::default()
        };
        ClusterCoordinator::new(&config, InstanceName::from(name), store, clock)
    }

    #[test]
    fn stale_heartbeat_is_reported_dead_but_kept() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let a = coordinator(Arc::clone(&store), Arc::clone(&clock), "a");
        a.register().unwrap();

        clock.advance(Duration::from_millis(3_000));
        assert!(a.instances().unwrap()[0].alive);

        clock.advance(Duration::from_millis(1));
        let seen = a.instances().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].alive);

        a.heartbeat().unwrap();
        assert!(a.instances().unwrap()[0].alive);
    }

    #[test]
    fn heartbeat_recreates_missing_row() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let a = coordinator(Arc::clone(&store), clock, "a");
        a.register().unwrap();
        a.deregister().unwrap();
        assert!(a.instances().unwrap().is_empty());
        a.heartbeat().unwrap();
        assert_eq!(a.instances().unwrap().len(), 1);
    }

    #[test]
    fn lock_records_holder() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let a = coordinator(Arc::clone(&store), clock, "a");
        let value = a.try_acquire_lock(SCAN_LOCK, |_| Ok(7)).unwrap();
        assert_eq!(value, Some(7));
        let (holder, _) = store.lock_holder("default", SCAN_LOCK).unwrap().unwrap();
        assert_eq!(holder, InstanceName::from("a"));
    }
}
