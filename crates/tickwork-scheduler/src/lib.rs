//! `tickwork-scheduler`: clustered trigger scanning and job dispatch on a
//! shared SQLite store.
//!
//! # Overview
//!
//! Every instance of a namespace runs the same loops against one database:
//!
//! | Loop       | Period                 | Work                                            |
//! |------------|------------------------|-------------------------------------------------|
//! | heartbeat  | `heartbeat_interval_ms`| refresh this instance's registry row            |
//! | scan       | `scan_interval_ms`     | under the scan lock, claim due fires            |
//! | wheel      | `wheel.tick_ms`        | release fires whose time has come               |
//! | pump       | on demand              | run fires on at most `pool.workers` tasks       |
//! | janitor    | `purge_interval_secs`  | under the purge lock, drop logs past retention  |
//!
//! A fire is claimed exactly once cluster-wide: the scan transaction writes
//! the trigger's new state and one `trigger_logs` row per occurrence before
//! anything is executed.

pub mod admin;
pub mod clock;
pub mod cluster;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod log_listener;
pub mod runtime;
pub mod scanner;
pub mod schedule;
pub mod store;
pub mod wheel;

pub use admin::{Admin, ManualRun, SchedulerStats, TriggerPatch, UpcomingFire};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterCoordinator, InstanceStatus};
pub use dispatch::{Dispatcher, JobRunner, RunningJob};
pub use error::{Result, SchedulerError};
pub use log_listener::SchedulerLogListener;
pub use runtime::{SchedulerHandle, SchedulerRuntime};
pub use scanner::{Fire, PendingFires, ScanReport, ScanSettings, ScanState, Scanner};
pub use store::{ExecutionLogQuery, Store, TriggerLogQuery};
pub use wheel::{TimerHandle, TimingWheel, WheelTimer};
