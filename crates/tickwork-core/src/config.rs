use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TickworkError};
use crate::types::InstanceName;

pub const DEFAULT_NAMESPACE: &str = "default";
/// Liveness is judged over at least this many missed heartbeats.
pub const MIN_DEAD_AFTER_HEARTBEATS: u32 = 3;

/// Top-level config (tickwork.toml + TICKWORK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickworkConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub wheel: WheelConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub misfire: MisfireConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub executors: ExecutorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// When false the instance neither registers nor scans; it only executes
    /// manual runs.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Standby instances heartbeat and execute manual runs but never scan.
    #[serde(default)]
    pub standby: bool,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Generated at load time when unset.
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_dead_after_heartbeats")]
    pub dead_after_heartbeats: u32,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_load_weight")]
    pub load_weight: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            standby: false,
            namespace: default_namespace(),
            instance_name: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            dead_after_heartbeats: default_dead_after_heartbeats(),
            scan_interval_ms: default_scan_interval_ms(),
            lookahead_ms: default_lookahead_ms(),
            batch_size: default_batch_size(),
            lock_wait_ms: default_lock_wait_ms(),
            load_weight: default_load_weight(),
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// How stale a heartbeat may get before its instance counts as dead.
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval() * self.dead_after_heartbeats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WheelConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_slots")]
    pub slots: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            slots: default_slots(),
        }
    }
}

impl WheelConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrently running jobs on this instance.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Fires waiting for a worker; a full queue rejects new fires.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MisfireConfig {
    /// A trigger is misfired once its next fire time is this far in the past.
    #[serde(default = "default_misfire_threshold_ms")]
    pub threshold_ms: u64,
    /// Default replay cap for `fire_all_missed` triggers without their own.
    #[serde(default = "default_replay_cap")]
    pub replay_cap: u32,
}

impl Default for MisfireConfig {
    fn default() -> Self {
        Self {
            threshold_ms: default_misfire_threshold_ms(),
            replay_cap: default_replay_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Trigger, execution and scheduler logs older than this are purged.
    /// Zero disables the janitor.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl LogsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    /// Captured output beyond this is cut from the middle.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    /// Size of the script engine pool.
    #[serde(default = "default_script_engines")]
    pub script_engines: usize,
    /// Per-evaluation operation budget for scripts.
    #[serde(default = "default_script_max_operations")]
    pub script_max_operations: u64,
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        Self {
            max_output_chars: default_max_output_chars(),
            script_engines: default_script_engines(),
            script_max_operations: default_script_max_operations(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    3_000
}
fn default_dead_after_heartbeats() -> u32 {
    MIN_DEAD_AFTER_HEARTBEATS
}
fn default_scan_interval_ms() -> u64 {
    1_000
}
fn default_lookahead_ms() -> u64 {
    5_000
}
fn default_batch_size() -> u32 {
    500
}
fn default_lock_wait_ms() -> u64 {
    500
}
fn default_load_weight() -> f64 {
    1.0
}
fn default_tick_ms() -> u64 {
    100
}
fn default_slots() -> usize {
    512
}
fn default_workers() -> usize {
    16
}
fn default_queue_depth() -> usize {
    1024
}
fn default_misfire_threshold_ms() -> u64 {
    5_000
}
fn default_replay_cap() -> u32 {
    10
}
fn default_retention_hours() -> u64 {
    168
}
fn default_purge_interval_secs() -> u64 {
    3_600
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_max_output_chars() -> usize {
    16_000
}
fn default_script_engines() -> usize {
    4
}
fn default_script_max_operations() -> u64 {
    10_000_000
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.db", home)
}

impl TickworkConfig {
    /// Load config from a TOML file with TICKWORK_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `TICKWORK_SCHEDULER__NAMESPACE=billing`. A missing file is not an
    /// error; defaults apply.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        if !std::path::Path::new(&path).exists() {
            debug!(path = %path, "config file not found, using defaults and env");
        }

        let config: TickworkConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TICKWORK_").split("__"))
            .extract()
            .map_err(|e| TickworkError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break scheduler invariants.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.namespace.trim().is_empty() {
            return Err(TickworkError::Config("scheduler.namespace is empty".into()));
        }
        if s.dead_after_heartbeats < MIN_DEAD_AFTER_HEARTBEATS {
            return Err(TickworkError::Config(format!(
                "scheduler.dead_after_heartbeats must be >= {MIN_DEAD_AFTER_HEARTBEATS}, got {}",
                s.dead_after_heartbeats
            )));
        }
        for (key, value) in [
            ("scheduler.heartbeat_interval_ms", s.heartbeat_interval_ms),
            ("scheduler.scan_interval_ms", s.scan_interval_ms),
            ("scheduler.batch_size", s.batch_size as u64),
            ("wheel.tick_ms", self.wheel.tick_ms),
            ("wheel.slots", self.wheel.slots as u64),
            ("pool.workers", self.pool.workers as u64),
            ("pool.queue_depth", self.pool.queue_depth as u64),
            ("executors.script_engines", self.executors.script_engines as u64),
        ] {
            if value == 0 {
                return Err(TickworkError::Config(format!("{key} must be > 0")));
            }
        }
        if !(s.load_weight > 0.0) {
            return Err(TickworkError::Config("scheduler.load_weight must be > 0".into()));
        }
        Ok(())
    }

    /// Configured instance name, or a generated one.
    pub fn instance_name(&self) -> InstanceName {
        match &self.scheduler.instance_name {
            Some(name) if !name.trim().is_empty() => InstanceName::from(name.as_str()),
            _ => InstanceName::generate(),
        }
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.toml", home)
}
