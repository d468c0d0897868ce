use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Idempotent. All timestamps are epoch milliseconds (UTC); JSON columns hold
/// the serde form of the corresponding model enums.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id           INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            namespace    TEXT    NOT NULL,
            name         TEXT    NOT NULL,
            description  TEXT,
            kind         TEXT    NOT NULL,
            payload      TEXT    NOT NULL,   -- JSON JobPayload
            enabled      INTEGER NOT NULL DEFAULT 1,
            retry        TEXT    NOT NULL,   -- JSON RetryPolicy
            timeout_ms   INTEGER NOT NULL,
            allow_concurrent  INTEGER NOT NULL DEFAULT 1,
            max_reentry       INTEGER,            -- NULL: bounded by the pool
            run_count    INTEGER NOT NULL DEFAULT 0,
            last_run_at  INTEGER,
            last_status  TEXT,
            created_at   INTEGER NOT NULL,
            updated_at   INTEGER NOT NULL,
            UNIQUE (namespace, name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS triggers (
            id              INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            namespace       TEXT    NOT NULL,
            job_id          INTEGER NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            name            TEXT    NOT NULL,
            schedule        TEXT    NOT NULL,   -- JSON Schedule
            misfire_policy  TEXT    NOT NULL,   -- JSON MisfirePolicy
            start_at        INTEGER,
            end_at          INTEGER,
            next_fire_at    INTEGER,            -- NULL: exhausted or unusable
            last_fire_at    INTEGER,
            enabled         INTEGER NOT NULL DEFAULT 1,
            fire_count      INTEGER NOT NULL DEFAULT 0,
            last_error      TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            UNIQUE (namespace, name)
        ) STRICT;

        -- Scanner query: WHERE namespace = ? AND enabled = 1 AND next_fire_at <= ?
        --                ORDER BY next_fire_at, id
        CREATE INDEX IF NOT EXISTS idx_triggers_due
            ON triggers (namespace, enabled, next_fire_at, id);
        CREATE INDEX IF NOT EXISTS idx_triggers_job ON triggers (job_id);

        CREATE TABLE IF NOT EXISTS scheduler_instances (
            namespace              TEXT    NOT NULL,
            instance_name          TEXT    NOT NULL,
            last_heartbeat_at      INTEGER NOT NULL,
            heartbeat_interval_ms  INTEGER NOT NULL,
            load_weight            REAL    NOT NULL DEFAULT 1.0,
            standby                INTEGER NOT NULL DEFAULT 0,
            started_at             INTEGER NOT NULL,
            PRIMARY KEY (namespace, instance_name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS cluster_locks (
            namespace    TEXT    NOT NULL,
            name         TEXT    NOT NULL,
            holder       TEXT    NOT NULL,
            acquired_at  INTEGER NOT NULL,
            PRIMARY KEY (namespace, name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS trigger_logs (
            id             INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            namespace      TEXT    NOT NULL,
            trigger_id     INTEGER,            -- NULL for manual runs
            job_id         INTEGER NOT NULL,
            instance_name  TEXT    NOT NULL,
            fire_at        INTEGER NOT NULL,
            fired_at       INTEGER NOT NULL,
            misfired       INTEGER NOT NULL DEFAULT 0,
            manual         INTEGER NOT NULL DEFAULT 0,
            note           TEXT
        ) STRICT;

        -- One row per scheduled occurrence, cluster-wide.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_trigger_logs_occurrence
            ON trigger_logs (trigger_id, fire_at) WHERE manual = 0;
        CREATE INDEX IF NOT EXISTS idx_trigger_logs_fired
            ON trigger_logs (namespace, fired_at);

        CREATE TABLE IF NOT EXISTS execution_logs (
            id             INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            run_id         TEXT    NOT NULL,
            namespace      TEXT    NOT NULL,
            job_id         INTEGER NOT NULL,
            trigger_id     INTEGER,
            fire_at        INTEGER NOT NULL,
            attempt        INTEGER NOT NULL,
            instance_name  TEXT    NOT NULL,
            started_at     INTEGER NOT NULL,
            ended_at       INTEGER NOT NULL,
            status         TEXT    NOT NULL,
            error          TEXT,
            output         TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_execution_logs_job
            ON execution_logs (job_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_execution_logs_started
            ON execution_logs (namespace, started_at);

        CREATE TABLE IF NOT EXISTS scheduler_logs (
            id             INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            namespace      TEXT    NOT NULL,
            instance_name  TEXT    NOT NULL,
            event          TEXT    NOT NULL,
            detail         TEXT,
            created_at     INTEGER NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_scheduler_logs_created
            ON scheduler_logs (namespace, created_at);
        ",
    )?;
    Ok(())
}
