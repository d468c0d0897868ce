//! SQLite-backed job store.
//!
//! One [`Store`] per process wraps a single connection behind a mutex, like
//! every other SQLite-backed manager in this workspace. Instances sharing a
//! database file coordinate only through `BEGIN IMMEDIATE` transactions on the
//! `cluster_locks` table (see [`Store::with_lock`]).
//!
//! Functions that must run inside the scan transaction take a bare
//! `&Connection` (a `Transaction` derefs to one) instead of `&self`.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tickwork_core::model::{
    ExecutionLog, Job, JobKind, NewJob, NewTrigger, RunStatus, SchedulerInstance,
    SchedulerLogEntry, Trigger, TriggerLog,
};
use tickwork_core::types::{InstanceName, JobId, RunId, TriggerId};
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};

// ---------------------------------------------------------------------------
// Time and column helpers
// ---------------------------------------------------------------------------

pub fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn opt_ms(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_ms)
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    row.get::<_, i64>(idx).map(from_ms)
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_ms))
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const JOB_COLUMNS: &str = "id, namespace, name, description, kind, payload, enabled, retry,
    timeout_ms, run_count, last_run_at, last_status, created_at, updated_at, allow_concurrent,
    max_reentry";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let last_status: Option<String> = row.get(11)?;
    Ok(Job {
        id: JobId(row.get(0)?),
        namespace: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        kind: parsed_col::<JobKind>(row, 4)?,
        payload: json_col(row, 5)?,
        enabled: row.get(6)?,
        retry: json_col(row, 7)?,
        timeout_ms: row.get::<_, i64>(8)? as u64,
        run_count: row.get::<_, i64>(9)? as u64,
        last_run_at: opt_time_col(row, 10)?,
        last_status: last_status
            .map(|s| s.parse::<RunStatus>())
            .transpose()
            .map_err(|e| conversion_error(11, e))?,
        created_at: time_col(row, 12)?,
        updated_at: time_col(row, 13)?,
        allow_concurrent: row.get(14)?,
        max_reentry: row.get::<_, Option<i64>>(15)?.map(|n| n as u32),
    })
}

const TRIGGER_COLUMNS: &str = "t.id, t.namespace, t.job_id, t.name, t.schedule, t.misfire_policy,
    t.start_at, t.end_at, t.next_fire_at, t.last_fire_at, t.enabled, t.fire_count, t.last_error,
    t.created_at, t.updated_at";

fn row_to_trigger(row: &Row<'_>) -> rusqlite::Result<Trigger> {
    Ok(Trigger {
        id: TriggerId(row.get(0)?),
        namespace: row.get(1)?,
        job_id: JobId(row.get(2)?),
        name: row.get(3)?,
        schedule: json_col(row, 4)?,
        misfire_policy: json_col(row, 5)?,
        start_at: opt_time_col(row, 6)?,
        end_at: opt_time_col(row, 7)?,
        next_fire_at: opt_time_col(row, 8)?,
        last_fire_at: opt_time_col(row, 9)?,
        enabled: row.get(10)?,
        fire_count: row.get::<_, i64>(11)? as u64,
        last_error: row.get(12)?,
        created_at: time_col(row, 13)?,
        updated_at: time_col(row, 14)?,
    })
}

const INSTANCE_COLUMNS: &str = "namespace, instance_name, last_heartbeat_at, heartbeat_interval_ms,
    load_weight, standby, started_at";

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<SchedulerInstance> {
    Ok(SchedulerInstance {
        namespace: row.get(0)?,
        instance_name: InstanceName(row.get(1)?),
        last_heartbeat_at: time_col(row, 2)?,
        heartbeat_interval_ms: row.get::<_, i64>(3)? as u64,
        load_weight: row.get(4)?,
        standby: row.get(5)?,
        started_at: time_col(row, 6)?,
    })
}

const TRIGGER_LOG_COLUMNS: &str = "id, namespace, trigger_id, job_id, instance_name, fire_at,
    fired_at, misfired, manual, note";

fn row_to_trigger_log(row: &Row<'_>) -> rusqlite::Result<TriggerLog> {
    Ok(TriggerLog {
        id: row.get(0)?,
        namespace: row.get(1)?,
        trigger_id: row.get::<_, Option<i64>>(2)?.map(TriggerId),
        job_id: JobId(row.get(3)?),
        instance_name: InstanceName(row.get(4)?),
        fire_at: time_col(row, 5)?,
        fired_at: time_col(row, 6)?,
        misfired: row.get(7)?,
        manual: row.get(8)?,
        note: row.get(9)?,
    })
}

const EXECUTION_LOG_COLUMNS: &str = "id, run_id, namespace, job_id, trigger_id, fire_at, attempt,
    instance_name, started_at, ended_at, status, error, output";

fn row_to_execution_log(row: &Row<'_>) -> rusqlite::Result<ExecutionLog> {
    Ok(ExecutionLog {
        id: row.get(0)?,
        run_id: parsed_col::<RunId>(row, 1)?,
        namespace: row.get(2)?,
        job_id: JobId(row.get(3)?),
        trigger_id: row.get::<_, Option<i64>>(4)?.map(TriggerId),
        fire_at: time_col(row, 5)?,
        attempt: row.get::<_, i64>(6)? as u32,
        instance_name: InstanceName(row.get(7)?),
        started_at: time_col(row, 8)?,
        ended_at: time_col(row, 9)?,
        status: parsed_col::<RunStatus>(row, 10)?,
        error: row.get(11)?,
        output: row.get(12)?,
    })
}

fn row_to_scheduler_log(row: &Row<'_>) -> rusqlite::Result<SchedulerLogEntry> {
    Ok(SchedulerLogEntry {
        id: row.get(0)?,
        namespace: row.get(1)?,
        instance_name: InstanceName(row.get(2)?),
        event: row.get(3)?,
        detail: row.get(4)?,
        created_at: time_col(row, 5)?,
    })
}

// ---------------------------------------------------------------------------
// Inputs and query filters
// ---------------------------------------------------------------------------

/// A trigger-log row about to be written.
#[derive(Debug, Clone)]
pub struct NewTriggerLog<'a> {
    pub namespace: &'a str,
    pub trigger_id: Option<TriggerId>,
    pub job_id: JobId,
    pub instance_name: &'a InstanceName,
    pub fire_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub misfired: bool,
    pub manual: bool,
    pub note: Option<&'a str>,
}

/// An execution-log row about to be written.
#[derive(Debug, Clone)]
pub struct NewExecutionLog<'a> {
    pub run_id: RunId,
    pub namespace: &'a str,
    pub job_id: JobId,
    pub trigger_id: Option<TriggerId>,
    pub fire_at: DateTime<Utc>,
    pub attempt: u32,
    pub instance_name: &'a InstanceName,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    pub error: Option<&'a str>,
    pub output: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionLogQuery {
    pub job_id: Option<JobId>,
    pub trigger_id: Option<TriggerId>,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Defaults to 100.
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerLogQuery {
    pub job_id: Option<JobId>,
    pub trigger_id: Option<TriggerId>,
    pub misfired: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Failure count of one job over a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobErrorCount {
    pub job_id: JobId,
    pub job_name: String,
    pub failures: u64,
}

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub trigger_logs: usize,
    pub execution_logs: usize,
    pub scheduler_logs: usize,
}

impl PurgeCounts {
    pub fn total(&self) -> usize {
        self.trigger_logs + self.execution_logs + self.scheduler_logs
    }
}

/// Incremental WHERE clause with positional parameters.
struct Filter {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Filter {
    fn new(namespace: &str) -> Self {
        Self {
            clauses: vec!["namespace = ?".to_string()],
            params: vec![Value::Text(namespace.to_string())],
        }
    }

    fn push(&mut self, clause: &str, value: Value) {
        self.clauses.push(clause.to_string());
        self.params.push(value);
    }

    fn sql(&self) -> String {
        self.clauses.join(" AND ")
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Mutex<Connection>,
    busy_timeout: Duration,
}

impl Store {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &str, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SchedulerError::Config(format!("database dir {parent:?}: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn, busy_timeout)
    }

    /// Private in-memory database; for tests and single-instance tools.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn, Duration::from_secs(5))
    }

    fn from_connection(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            busy_timeout,
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    /// Run `work` while holding the cluster lock `(namespace, lock_name)`.
    ///
    /// The lock is an immediate (write) transaction that upserts the lock
    /// row, so exactly one connection across all processes can be inside at
    /// a time. Returns `Ok(None)` when the lock could not be taken within
    /// `wait`; the caller skips its cycle. `work` errors roll back.
    pub fn with_lock<T>(
        &self,
        namespace: &str,
        lock_name: &str,
        holder: &InstanceName,
        now: DateTime<Utc>,
        wait: Duration,
        work: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        let mut conn = self.conn();
        conn.busy_timeout(wait)?;
        let err = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => {
                return self
                    .run_locked(tx, namespace, lock_name, holder, now, work)
                    .map(Some)
            }
            Err(e) => e,
        };
        conn.busy_timeout(self.busy_timeout)?;
        if is_busy(&err) {
            debug!(lock = lock_name, "cluster lock busy");
            return Ok(None);
        }
        Err(err.into())
    }

    fn run_locked<T>(
        &self,
        tx: Transaction<'_>,
        namespace: &str,
        lock_name: &str,
        holder: &InstanceName,
        now: DateTime<Utc>,
        work: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        // Statements inside the transaction never wait on other writers.
        tx.busy_timeout(self.busy_timeout)?;
        tx.execute(
            "INSERT INTO cluster_locks (namespace, name, holder, acquired_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (namespace, name)
             DO UPDATE SET holder = excluded.holder, acquired_at = excluded.acquired_at",
            params![namespace, lock_name, holder.as_str(), to_ms(now)],
        )?;
        let value = work(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // -- jobs -------------------------------------------------------------

    #[instrument(skip(self, job), fields(namespace = %job.namespace, name = %job.name))]
    pub fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job> {
        job.validate()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO jobs
             (namespace, name, description, kind, payload, enabled, retry, timeout_ms,
              allow_concurrent, max_reentry, run_count, last_run_at, last_status,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, NULL, ?11, ?11)",
            params![
                job.namespace,
                job.name,
                job.description,
                job.kind().as_str(),
                serde_json::to_string(&job.payload)?,
                job.enabled,
                serde_json::to_string(&job.retry)?,
                job.timeout_ms as i64,
                job.allow_concurrent,
                job.max_reentry.map(i64::from),
                to_ms(now),
            ],
        )?;
        let id = JobId(conn.last_insert_rowid());
        info!(job_id = %id, "job created");
        Ok(Job {
            id,
            namespace: job.namespace.clone(),
            name: job.name.clone(),
            description: job.description.clone(),
            kind: job.kind(),
            payload: job.payload.clone(),
            enabled: job.enabled,
            retry: job.retry.clone(),
            timeout_ms: job.timeout_ms,
            allow_concurrent: job.allow_concurrent,
            max_reentry: job.max_reentry,
            run_count: 0,
            last_run_at: None,
            last_status: None,
            created_at: from_ms(to_ms(now)),
            updated_at: from_ms(to_ms(now)),
        })
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id.0],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn find_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE namespace = ?1 AND name = ?2"),
                params![namespace, name],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn list_jobs(&self, namespace: &str) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE namespace = ?1 ORDER BY id"))?;
        let jobs = stmt
            .query_map([namespace], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Persist the definitional fields of `job`. Bookkeeping columns are
    /// owned by dispatch and left alone.
    pub fn update_job(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        job.validate()?;
        let n = self.conn().execute(
            "UPDATE jobs SET name = ?1, description = ?2, kind = ?3, payload = ?4, enabled = ?5,
                    retry = ?6, timeout_ms = ?7, allow_concurrent = ?8, max_reentry = ?9,
                    updated_at = ?10
             WHERE id = ?11",
            params![
                job.name,
                job.description,
                job.kind.as_str(),
                serde_json::to_string(&job.payload)?,
                job.enabled,
                serde_json::to_string(&job.retry)?,
                job.timeout_ms as i64,
                job.allow_concurrent,
                job.max_reentry.map(i64::from),
                to_ms(now),
                job.id.0,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id });
        }
        Ok(())
    }

    /// Delete a job and, through the foreign key, its triggers. Logs stay.
    pub fn delete_job(&self, id: JobId) -> Result<()> {
        let n = self.conn().execute("DELETE FROM jobs WHERE id = ?1", [id.0])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id });
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Bookkeeping after a run: bump `run_count`, set last run time and status.
    pub fn record_job_run(&self, id: JobId, status: RunStatus, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE jobs SET run_count = run_count + 1, last_run_at = ?1, last_status = ?2
             WHERE id = ?3",
            params![to_ms(at), status.as_str(), id.0],
        )?;
        Ok(())
    }

    // -- triggers ---------------------------------------------------------

    /// Insert a trigger whose first fire time has already been computed.
    pub fn insert_trigger(
        &self,
        namespace: &str,
        trigger: &NewTrigger,
        next_fire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Trigger> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO triggers
             (namespace, job_id, name, schedule, misfire_policy, start_at, end_at,
              next_fire_at, last_fire_at, enabled, fire_count, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, 0, NULL, ?10, ?10)",
            params![
                namespace,
                trigger.job_id.0,
                trigger.name,
                serde_json::to_string(&trigger.schedule)?,
                serde_json::to_string(&trigger.misfire_policy)?,
                opt_ms(trigger.start_at),
                opt_ms(trigger.end_at),
                opt_ms(next_fire_at),
                trigger.enabled,
                to_ms(now),
            ],
        )?;
        let id = TriggerId(conn.last_insert_rowid());
        info!(trigger_id = %id, job_id = %trigger.job_id, "trigger created");
        get_trigger_on(&conn, id)?.ok_or(SchedulerError::TriggerNotFound { id })
    }

    pub fn get_trigger(&self, id: TriggerId) -> Result<Option<Trigger>> {
        get_trigger_on(&self.conn(), id)
    }

    pub fn list_triggers(&self, namespace: &str, job_id: Option<JobId>) -> Result<Vec<Trigger>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers t
             WHERE t.namespace = ?1 AND (?2 IS NULL OR t.job_id = ?2)
             ORDER BY t.id"
        ))?;
        let triggers = stmt
            .query_map(params![namespace, job_id.map(|j| j.0)], row_to_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(triggers)
    }

    /// Persist every mutable field of `trigger` (admin edits, re-enable).
    pub fn update_trigger(&self, trigger: &Trigger, now: DateTime<Utc>) -> Result<()> {
        update_trigger_on(&self.conn(), trigger, now)
    }

    pub fn delete_trigger(&self, id: TriggerId) -> Result<()> {
        let n = self.conn().execute("DELETE FROM triggers WHERE id = ?1", [id.0])?;
        if n == 0 {
            return Err(SchedulerError::TriggerNotFound { id });
        }
        info!(trigger_id = %id, "trigger deleted");
        Ok(())
    }

    /// Enabled triggers with a pending fire, soonest first.
    pub fn upcoming_triggers(&self, namespace: &str, limit: u32) -> Result<Vec<Trigger>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers t
             JOIN jobs j ON j.id = t.job_id
             WHERE t.namespace = ?1 AND t.enabled = 1 AND j.enabled = 1
               AND t.next_fire_at IS NOT NULL
             ORDER BY t.next_fire_at, t.id
             LIMIT ?2"
        ))?;
        let triggers = stmt
            .query_map(params![namespace, limit], row_to_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(triggers)
    }

    // -- logs ------------------------------------------------------------

    /// Write a trigger-log row outside any scan (manual runs). Returns the
    /// row id, or `None` if the occurrence was already claimed.
    pub fn insert_trigger_log(&self, log: &NewTriggerLog<'_>) -> Result<Option<i64>> {
        let conn = self.conn();
        let inserted = insert_trigger_log(&conn, log)?;
        Ok(inserted.then(|| conn.last_insert_rowid()))
    }

    pub fn insert_execution_log(&self, log: &NewExecutionLog<'_>) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO execution_logs
             (run_id, namespace, job_id, trigger_id, fire_at, attempt, instance_name,
              started_at, ended_at, status, error, output)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                log.run_id.to_string(),
                log.namespace,
                log.job_id.0,
                log.trigger_id.map(|t| t.0),
                to_ms(log.fire_at),
                log.attempt,
                log.instance_name.as_str(),
                to_ms(log.started_at),
                to_ms(log.ended_at),
                log.status.as_str(),
                log.error,
                log.output,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_scheduler_log(
        &self,
        namespace: &str,
        instance_name: &InstanceName,
        event: &str,
        detail: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO scheduler_logs (namespace, instance_name, event, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![namespace, instance_name.as_str(), event, detail, to_ms(at)],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn query_execution_logs(
        &self,
        namespace: &str,
        query: &ExecutionLogQuery,
    ) -> Result<Vec<ExecutionLog>> {
        let mut filter = Filter::new(namespace);
        if let Some(job_id) = query.job_id {
            filter.push("job_id = ?", Value::Integer(job_id.0));
        }
        if let Some(trigger_id) = query.trigger_id {
            filter.push("trigger_id = ?", Value::Integer(trigger_id.0));
        }
        if let Some(status) = query.status {
            filter.push("status = ?", Value::Text(status.as_str().to_string()));
        }
        if let Some(since) = query.since {
            filter.push("started_at >= ?", Value::Integer(to_ms(since)));
        }
        if let Some(until) = query.until {
            filter.push("started_at < ?", Value::Integer(to_ms(until)));
        }
        let sql = format!(
            "SELECT {EXECUTION_LOG_COLUMNS} FROM execution_logs WHERE {}
             ORDER BY started_at DESC, id DESC LIMIT {}",
            filter.sql(),
            query.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params_from_iter(filter.params.iter()), row_to_execution_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    /// Newest first.
    pub fn query_trigger_logs(
        &self,
        namespace: &str,
        query: &TriggerLogQuery,
    ) -> Result<Vec<TriggerLog>> {
        let mut filter = Filter::new(namespace);
        if let Some(job_id) = query.job_id {
            filter.push("job_id = ?", Value::Integer(job_id.0));
        }
        if let Some(trigger_id) = query.trigger_id {
            filter.push("trigger_id = ?", Value::Integer(trigger_id.0));
        }
        if let Some(misfired) = query.misfired {
            filter.push("misfired = ?", Value::Integer(misfired as i64));
        }
        if let Some(since) = query.since {
            filter.push("fired_at >= ?", Value::Integer(to_ms(since)));
        }
        if let Some(until) = query.until {
            filter.push("fired_at < ?", Value::Integer(to_ms(until)));
        }
        let sql = format!(
            "SELECT {TRIGGER_LOG_COLUMNS} FROM trigger_logs WHERE {}
             ORDER BY fired_at DESC, id DESC LIMIT {}",
            filter.sql(),
            query.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params_from_iter(filter.params.iter()), row_to_trigger_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    /// Newest first.
    pub fn scheduler_logs(&self, namespace: &str, limit: u32) -> Result<Vec<SchedulerLogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, namespace, instance_name, event, detail, created_at
             FROM scheduler_logs WHERE namespace = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let logs = stmt
            .query_map(params![namespace, limit], row_to_scheduler_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    // -- statistics ----------------------------------------------------------

    pub fn count_jobs_by_kind(&self, namespace: &str) -> Result<Vec<(JobKind, u64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) FROM jobs WHERE namespace = ?1 GROUP BY kind ORDER BY kind",
        )?;
        let counts = stmt
            .query_map([namespace], |row| {
                Ok((parsed_col::<JobKind>(row, 0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    /// Jobs with the most failed or timed-out attempts since `since`.
    pub fn error_ranking(
        &self,
        namespace: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<JobErrorCount>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.job_id, COALESCE(j.name, '#' || e.job_id), COUNT(*) AS failures
             FROM execution_logs e
             LEFT JOIN jobs j ON j.id = e.job_id
             WHERE e.namespace = ?1 AND e.status IN ('failed', 'timed_out') AND e.started_at >= ?2
             GROUP BY e.job_id
             ORDER BY failures DESC, e.job_id
             LIMIT ?3",
        )?;
        let ranking = stmt
            .query_map(params![namespace, to_ms(since), limit], |row| {
                Ok(JobErrorCount {
                    job_id: JobId(row.get(0)?),
                    job_name: row.get(1)?,
                    failures: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ranking)
    }

    // -- retention ---------------------------------------------------------

    /// Delete log rows older than `cutoff`. Meant to run under the purge lock.
    pub fn purge_logs(conn: &Connection, namespace: &str, cutoff: DateTime<Utc>) -> Result<PurgeCounts> {
        let cutoff = to_ms(cutoff);
        Ok(PurgeCounts {
            trigger_logs: conn.execute(
                "DELETE FROM trigger_logs WHERE namespace = ?1 AND fired_at < ?2",
                params![namespace, cutoff],
            )?,
            execution_logs: conn.execute(
                "DELETE FROM execution_logs WHERE namespace = ?1 AND ended_at < ?2",
                params![namespace, cutoff],
            )?,
            scheduler_logs: conn.execute(
                "DELETE FROM scheduler_logs WHERE namespace = ?1 AND created_at < ?2",
                params![namespace, cutoff],
            )?,
        })
    }

    // -- instance registry --------------------------------------------------

    pub fn upsert_instance(&self, instance: &SchedulerInstance) -> Result<()> {
        self.conn().execute(
            "INSERT INTO scheduler_instances
             (namespace, instance_name, last_heartbeat_at, heartbeat_interval_ms,
              load_weight, standby, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (namespace, instance_name) DO UPDATE SET
                last_heartbeat_at = excluded.last_heartbeat_at,
                heartbeat_interval_ms = excluded.heartbeat_interval_ms,
                load_weight = excluded.load_weight,
                standby = excluded.standby,
                started_at = excluded.started_at",
            params![
                instance.namespace,
                instance.instance_name.as_str(),
                to_ms(instance.last_heartbeat_at),
                instance.heartbeat_interval_ms as i64,
                instance.load_weight,
                instance.standby,
                to_ms(instance.started_at),
            ],
        )?;
        Ok(())
    }

    /// Refresh a heartbeat. Returns false if the row is gone.
    pub fn touch_instance(
        &self,
        namespace: &str,
        instance_name: &InstanceName,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE scheduler_instances SET last_heartbeat_at = ?1
             WHERE namespace = ?2 AND instance_name = ?3",
            params![to_ms(at), namespace, instance_name.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn delete_instance(&self, namespace: &str, instance_name: &InstanceName) -> Result<()> {
        self.conn().execute(
            "DELETE FROM scheduler_instances WHERE namespace = ?1 AND instance_name = ?2",
            params![namespace, instance_name.as_str()],
        )?;
        Ok(())
    }

    pub fn list_instances(&self, namespace: &str) -> Result<Vec<SchedulerInstance>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM scheduler_instances
             WHERE namespace = ?1 ORDER BY instance_name"
        ))?;
        let instances = stmt
            .query_map([namespace], row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(instances)
    }

    /// Current holder of a cluster lock, with the time it was last taken.
    pub fn lock_holder(
        &self,
        namespace: &str,
        lock_name: &str,
    ) -> Result<Option<(InstanceName, DateTime<Utc>)>> {
        let conn = self.conn();
        let holder = conn
            .query_row(
                "SELECT holder, acquired_at FROM cluster_locks WHERE namespace = ?1 AND name = ?2",
                params![namespace, lock_name],
                |row| Ok((InstanceName(row.get(0)?), time_col(row, 1)?)),
            )
            .optional()?;
        Ok(holder)
    }
}

// ---------------------------------------------------------------------------
// Scan-transaction operations
// ---------------------------------------------------------------------------

/// [`Store::update_trigger`] on a caller-held connection, typically inside
/// the scan lock.
pub fn update_trigger_on(conn: &Connection, trigger: &Trigger, now: DateTime<Utc>) -> Result<()> {
    let n = conn.execute(
        "UPDATE triggers SET name = ?1, schedule = ?2, misfire_policy = ?3, start_at = ?4,
                end_at = ?5, next_fire_at = ?6, enabled = ?7, last_error = ?8, updated_at = ?9
         WHERE id = ?10",
        params![
            trigger.name,
            serde_json::to_string(&trigger.schedule)?,
            serde_json::to_string(&trigger.misfire_policy)?,
            opt_ms(trigger.start_at),
            opt_ms(trigger.end_at),
            opt_ms(trigger.next_fire_at),
            trigger.enabled,
            trigger.last_error,
            to_ms(now),
            trigger.id.0,
        ],
    )?;
    if n == 0 {
        return Err(SchedulerError::TriggerNotFound { id: trigger.id });
    }
    Ok(())
}

pub fn get_trigger_on(conn: &Connection, id: TriggerId) -> Result<Option<Trigger>> {
    let trigger = conn
        .query_row(
            &format!("SELECT {TRIGGER_COLUMNS} FROM triggers t WHERE t.id = ?1"),
            [id.0],
            row_to_trigger,
        )
        .optional()?;
    Ok(trigger)
}

/// One row returned by [`due_triggers`].
#[derive(Debug)]
pub enum DueTrigger {
    Ready(Trigger),
    /// The row exists but its columns do not decode (unknown schedule type,
    /// hand-edited JSON). Parked by the scanner, never fatal to the scan.
    Undecodable { id: TriggerId, reason: String },
}

impl DueTrigger {
    pub fn id(&self) -> TriggerId {
        match self {
            DueTrigger::Ready(t) => t.id,
            DueTrigger::Undecodable { id, .. } => *id,
        }
    }
}

/// Enabled triggers of enabled jobs due by `horizon`, ordered by
/// `(next_fire_at, id)`. Rows are decoded one by one.
pub fn due_triggers(
    conn: &Connection,
    namespace: &str,
    horizon: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<DueTrigger>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TRIGGER_COLUMNS} FROM triggers t
         JOIN jobs j ON j.id = t.job_id
         WHERE t.namespace = ?1 AND t.enabled = 1 AND j.enabled = 1
           AND t.next_fire_at IS NOT NULL AND t.next_fire_at <= ?2
         ORDER BY t.next_fire_at, t.id
         LIMIT ?3"
    ))?;
    let triggers = stmt
        .query_map(params![namespace, to_ms(horizon), limit], |row| {
            let id = TriggerId(row.get(0)?);
            Ok(match row_to_trigger(row) {
                Ok(trigger) => DueTrigger::Ready(trigger),
                Err(e) => DueTrigger::Undecodable {
                    id,
                    reason: format!("undecodable trigger row: {e}"),
                },
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(triggers)
}

/// Record the result of planning one trigger.
pub fn advance_trigger(
    conn: &Connection,
    id: TriggerId,
    next_fire_at: Option<DateTime<Utc>>,
    last_fire_at: Option<DateTime<Utc>>,
    fired: u64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE triggers SET next_fire_at = ?1, last_fire_at = COALESCE(?2, last_fire_at),
                fire_count = fire_count + ?3, last_error = NULL, updated_at = ?4
         WHERE id = ?5",
        params![opt_ms(next_fire_at), opt_ms(last_fire_at), fired as i64, to_ms(now), id.0],
    )?;
    Ok(())
}

/// Park a trigger whose schedule cannot be evaluated.
pub fn invalidate_trigger(conn: &Connection, id: TriggerId, error: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE triggers SET next_fire_at = NULL, last_error = ?1, updated_at = ?2 WHERE id = ?3",
        params![error, to_ms(now), id.0],
    )?;
    Ok(())
}

/// Returns false if this scheduled occurrence was already claimed.
pub fn insert_trigger_log(conn: &Connection, log: &NewTriggerLog<'_>) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO trigger_logs
         (namespace, trigger_id, job_id, instance_name, fire_at, fired_at, misfired, manual, note)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            log.namespace,
            log.trigger_id.map(|t| t.0),
            log.job_id.0,
            log.instance_name.as_str(),
            to_ms(log.fire_at),
            to_ms(log.fired_at),
            log.misfired,
            log.manual,
            log.note,
        ],
    )?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tickwork_core::model::{JobPayload, Schedule, ShellJob, ShellType};

    fn shell_job(name: &str) -> NewJob {
        NewJob::new(
            "default",
            name,
            JobPayload::Shell(ShellJob {
                shell: ShellType::Sh,
                script: "true".to_string(),
                env: BTreeMap::new(),
                working_dir: None,
            }),
        )
    }

    fn at(ms: i64) -> DateTime<Utc> {
        from_ms(1_700_000_000_000 + ms)
    }

    #[test]
    fn job_round_trips_through_sqlite() {
        let store = Store::open_in_memory().unwrap();
        let created = store.insert_job(&shell_job("a"), at(0)).unwrap();
        let loaded = store.get_job(created.id).unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(store.find_job("default", "a").unwrap().unwrap().id, created.id);
    }

    #[test]
    fn duplicate_job_name_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.insert_job(&shell_job("a"), at(0)).unwrap();
        assert!(matches!(
            store.insert_job(&shell_job("a"), at(0)),
            Err(SchedulerError::Database(_))
        ));
    }

    #[test]
    fn deleting_job_cascades_to_triggers() {
        let store = Store::open_in_memory().unwrap();
        let job = store.insert_job(&shell_job("a"), at(0)).unwrap();
        let trigger = store
            .insert_trigger(
                "default",
                &NewTrigger::new(job.id, "t", Schedule::FixedInterval { every_ms: 1_000 }),
                Some(at(1_000)),
                at(0),
            )
            .unwrap();
        store.delete_job(job.id).unwrap();
        assert!(store.get_trigger(trigger.id).unwrap().is_none());
    }

    #[test]
    fn due_triggers_order_by_time_then_id_and_skip_disabled_jobs() {
        let store = Store::open_in_memory().unwrap();
        let job = store.insert_job(&shell_job("a"), at(0)).unwrap();
        let off = store.insert_job(&shell_job("off").disabled(), at(0)).unwrap();
        let every = Schedule::FixedInterval { every_ms: 1_000 };
        let late = store
            .insert_trigger("default", &NewTrigger::new(job.id, "late", every.clone()), Some(at(2_000)), at(0))
            .unwrap();
        let first = store
            .insert_trigger("default", &NewTrigger::new(job.id, "first", every.clone()), Some(at(1_000)), at(0))
            .unwrap();
        let second = store
            .insert_trigger("default", &NewTrigger::new(job.id, "second", every.clone()), Some(at(1_000)), at(0))
            .unwrap();
        store
            .insert_trigger("default", &NewTrigger::new(off.id, "ignored", every), Some(at(500)), at(0))
            .unwrap();

        let conn = store.conn();
        let due: Vec<TriggerId> = due_triggers(&conn, "default", at(5_000), 10)
            .unwrap()
            .iter()
            .map(DueTrigger::id)
            .collect();
        assert_eq!(due, vec![first.id, second.id, late.id]);
    }

    #[test]
    fn scheduled_occurrence_is_claimed_once() {
        let store = Store::open_in_memory().unwrap();
        let instance = InstanceName::from("a");
        let log = NewTriggerLog {
            namespace: "default",
            trigger_id: Some(TriggerId(1)),
            job_id: JobId(1),
            instance_name: &instance,
            fire_at: at(1_000),
            fired_at: at(0),
            misfired: false,
            manual: false,
            note: None,
        };
        assert!(store.insert_trigger_log(&log).unwrap().is_some());
        assert!(store.insert_trigger_log(&log).unwrap().is_none());

        // Manual rows never collide.
        let manual = NewTriggerLog {
            trigger_id: None,
            manual: true,
            ..log
        };
        assert!(store.insert_trigger_log(&manual).unwrap().is_some());
        assert!(store.insert_trigger_log(&manual).unwrap().is_some());
    }

    #[test]
    fn execution_log_filters() {
        let store = Store::open_in_memory().unwrap();
        let instance = InstanceName::from("a");
        for (attempt, status) in [(1, RunStatus::Failed), (2, RunStatus::Succeeded)] {
            store
                .insert_execution_log(&NewExecutionLog {
                    run_id: RunId::new(),
                    namespace: "default",
                    job_id: JobId(3),
                    trigger_id: None,
                    fire_at: at(0),
                    attempt,
                    instance_name: &instance,
                    started_at: at(attempt as i64 * 100),
                    ended_at: at(attempt as i64 * 100 + 50),
                    status,
                    error: None,
                    output: None,
                })
                .unwrap();
        }

        let failed = store
            .query_execution_logs(
                "default",
                &ExecutionLogQuery {
                    status: Some(RunStatus::Failed),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempt, 1);

        let all = store
            .query_execution_logs(
                "default",
                &ExecutionLogQuery {
                    job_id: Some(JobId(3)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(all.iter().map(|l| l.attempt).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn purge_removes_only_old_rows() {
        let store = Store::open_in_memory().unwrap();
        let instance = InstanceName::from("a");
        store
            .insert_scheduler_log("default", &instance, "started", None, at(0))
            .unwrap();
        store
            .insert_scheduler_log("default", &instance, "stopped", None, at(10_000))
            .unwrap();

        let counts = store
            .with_lock("default", "log_purge", &instance, at(20_000), Duration::from_millis(100), |tx| {
                Store::purge_logs(tx, "default", at(5_000))
            })
            .unwrap()
            .unwrap();
        assert_eq!(counts.scheduler_logs, 1);
        assert_eq!(store.scheduler_logs("default", 10).unwrap()[0].event, "stopped");
    }
}
