//! Persisted data model: jobs, triggers, scheduler instances and the
//! append-only logs.
//!
//! The store maps these structs 1:1 onto relational rows; everything here is
//! plain data plus validation so every crate agrees on what a well-formed job
//! or trigger is.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TickworkError};
use crate::types::{InstanceName, JobId, RunId, TriggerId};

// ---------------------------------------------------------------------------
// Job kinds and payloads
// ---------------------------------------------------------------------------

/// The closed set of job kinds the scheduler knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Outbound HTTP request.
    Http,
    /// Named procedure registered inside the scheduler process.
    Procedure,
    /// Embedded script evaluated by a pooled engine.
    Script,
    /// External process started through a shell or interpreter.
    Shell,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Http,
        JobKind::Procedure,
        JobKind::Script,
        JobKind::Shell,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Http => "http",
            JobKind::Procedure => "procedure",
            JobKind::Script => "script",
            JobKind::Shell => "shell",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = TickworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(JobKind::Http),
            "procedure" => Ok(JobKind::Procedure),
            "script" => Ok(JobKind::Script),
            "shell" => Ok(JobKind::Shell),
            other => Err(TickworkError::UnknownVariant {
                what: "job kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Kind-specific job definition. Exactly one variant per [`JobKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Http(HttpJob),
    Procedure(ProcedureJob),
    Script(ScriptJob),
    Shell(ShellJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Http(_) => JobKind::Http,
            JobPayload::Procedure(_) => JobKind::Procedure,
            JobPayload::Script(_) => JobKind::Script,
            JobPayload::Shell(_) => JobKind::Shell,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            JobPayload::Http(http) => {
                if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                    return Err(TickworkError::validation(
                        "http job",
                        format!("url must be http(s): {}", http.url),
                    ));
                }
                if http.method.is_empty() || !http.method.chars().all(|c| c.is_ascii_alphabetic())
                {
                    return Err(TickworkError::validation(
                        "http job",
                        format!("bad method: {:?}", http.method),
                    ));
                }
            }
            JobPayload::Procedure(p) if p.name.trim().is_empty() => {
                return Err(TickworkError::validation("procedure job", "empty procedure name"));
            }
            JobPayload::Script(s) if s.source.trim().is_empty() => {
                return Err(TickworkError::validation("script job", "empty script source"));
            }
            JobPayload::Shell(s) if s.script.trim().is_empty() => {
                return Err(TickworkError::validation("shell job", "empty shell script"));
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpJob {
    #[serde(default = "default_http_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureJob {
    /// Registry name of the procedure.
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptJob {
    pub source: String,
    /// Exposed to the script as the `args` variable.
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellJob {
    #[serde(default)]
    pub shell: ShellType,
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Interpreter used to run a [`ShellJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellType {
    #[default]
    Bash,
    Sh,
    Python,
    Node,
}

impl ShellType {
    /// Program and leading arguments; the script text is appended last.
    pub fn command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ShellType::Bash => ("bash", &["-c"]),
            ShellType::Sh => ("sh", &["-c"]),
            ShellType::Python => ("python3", &["-c"]),
            ShellType::Node => ("node", &["-e"]),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff between attempts of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Backoff {
    /// Constant delay between attempts.
    pub fn fixed(ms: u64) -> Self {
        Self {
            initial_ms: ms,
            multiplier: 1.0,
            max_ms: ms,
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_ms as f64 * self.multiplier.powi(exp);
        let capped = raw.min(self.max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            multiplier: default_backoff_multiplier(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_max_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per fire, including the first one. Always >= 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }

    pub fn attempts(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TickworkError::validation("retry policy", "max_attempts must be >= 1"));
        }
        if !(self.backoff.multiplier >= 1.0) {
            return Err(TickworkError::validation(
                "retry policy",
                "backoff multiplier must be >= 1.0",
            ));
        }
        if self.backoff.max_ms < self.backoff.initial_ms {
            return Err(TickworkError::validation(
                "retry policy",
                "backoff max_ms must be >= initial_ms",
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

fn default_max_attempts() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Outcome recorded for one attempt and, as `last_status`, for the last run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Not started: the job's overlap limit on this instance was reached.
    Skipped,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = TickworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "timed_out" => Ok(RunStatus::TimedOut),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(TickworkError::UnknownVariant {
                what: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub namespace: String,
    /// Unique within the namespace.
    pub name: String,
    pub description: Option<String>,
    /// Declared kind; must match `payload.kind()`.
    pub kind: JobKind,
    pub payload: JobPayload,
    pub enabled: bool,
    pub retry: RetryPolicy,
    /// Hard limit for a single attempt.
    pub timeout_ms: u64,
    /// Let a fire start while an earlier run of this job is still executing
    /// on the same instance.
    pub allow_concurrent: bool,
    /// Overlapping runs allowed beyond the first when `allow_concurrent` is
    /// set. `None` leaves the bound to the worker pool.
    pub max_reentry: Option<u32>,
    pub run_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Most runs of this job that may execute at once on one instance.
    pub fn max_overlap(&self) -> Option<usize> {
        if !self.allow_concurrent {
            return Some(1);
        }
        self.max_reentry.map(|n| n as usize + 1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.payload.kind() != self.kind {
            return Err(TickworkError::validation(
                "job",
                format!(
                    "payload kind {} does not match declared kind {}",
                    self.payload.kind(),
                    self.kind
                ),
            ));
        }
        validate_job_fields(&self.name, &self.payload, &self.retry, self.timeout_ms)
    }
}

fn validate_job_fields(
    name: &str,
    payload: &JobPayload,
    retry: &RetryPolicy,
    timeout_ms: u64,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(TickworkError::validation("job", "empty name"));
    }
    if timeout_ms == 0 {
        return Err(TickworkError::validation("job", "timeout_ms must be > 0"));
    }
    payload.validate()?;
    retry.validate()
}

/// Input for creating a job. The kind is derived from the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub payload: JobPayload,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "bool_true")]
    pub allow_concurrent: bool,
    #[serde(default)]
    pub max_reentry: Option<u32>,
}

impl NewJob {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            description: None,
            payload,
            enabled: true,
            retry: RetryPolicy::none(),
            timeout_ms: default_timeout_ms(),
            allow_concurrent: true,
            max_reentry: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Never overlap: a fire arriving while a run is in progress is skipped.
    pub fn exclusive(mut self) -> Self {
        self.allow_concurrent = false;
        self
    }

    pub fn with_max_reentry(mut self, max_reentry: u32) -> Self {
        self.max_reentry = Some(max_reentry);
        self
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(TickworkError::validation("job", "empty namespace"));
        }
        validate_job_fields(&self.name, &self.payload, &self.retry, self.timeout_ms)
    }
}

/// Partial update applied by the administrative API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub payload: Option<JobPayload>,
    pub retry: Option<RetryPolicy>,
    pub timeout_ms: Option<u64>,
    pub enabled: Option<bool>,
    pub allow_concurrent: Option<bool>,
    pub max_reentry: Option<Option<u32>>,
}

impl JobPatch {
    /// Apply the patch in place. Changing the payload also changes the kind.
    pub fn apply(self, job: &mut Job) {
        if let Some(name) = self.name {
            job.name = name;
        }
        if let Some(description) = self.description {
            job.description = Some(description);
        }
        if let Some(payload) = self.payload {
            job.kind = payload.kind();
            job.payload = payload;
        }
        if let Some(retry) = self.retry {
            job.retry = retry;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            job.timeout_ms = timeout_ms;
        }
        if let Some(enabled) = self.enabled {
            job.enabled = enabled;
        }
        if let Some(allow_concurrent) = self.allow_concurrent {
            job.allow_concurrent = allow_concurrent;
        }
        if let Some(max_reentry) = self.max_reentry {
            job.max_reentry = max_reentry;
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    60_000
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// When a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression with a leading seconds field
    /// (`sec min hour day-of-month month day-of-week [year]`).
    Cron { expression: String },
    /// Fire every `every_ms` milliseconds.
    FixedInterval { every_ms: u64 },
    /// Fire exactly once at the given instant.
    Once { at: DateTime<Utc> },
}

/// What to do with occurrences that were missed by more than the misfire
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Drop missed occurrences and resume at the next future one.
    #[default]
    Ignore,
    /// Fire a single catch-up run now, then resume.
    FireOnceNow,
    /// Replay every missed occurrence up to `cap` (config default when unset).
    FireAllMissed {
        #[serde(default)]
        cap: Option<u32>,
    },
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfirePolicy::Ignore => "ignore",
            MisfirePolicy::FireOnceNow => "fire_once_now",
            MisfirePolicy::FireAllMissed { .. } => "fire_all_missed",
        }
    }
}

/// A persisted trigger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    pub namespace: String,
    pub job_id: JobId,
    pub name: String,
    pub schedule: Schedule,
    pub misfire_policy: MisfirePolicy,
    /// No occurrence before this instant.
    pub start_at: Option<DateTime<Utc>>,
    /// No occurrence after this instant.
    pub end_at: Option<DateTime<Utc>>,
    /// Owned by the scanner; `None` when exhausted or invalid.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub fire_count: u64,
    /// Set when the schedule could not be evaluated.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a trigger. The namespace is inherited from the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrigger {
    pub job_id: JobId,
    pub name: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

impl NewTrigger {
    pub fn new(job_id: JobId, name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            job_id,
            name: name.into(),
            schedule,
            misfire_policy: MisfirePolicy::default(),
            start_at: None,
            end_at: None,
            enabled: true,
        }
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_window(
        mut self,
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_at = start_at;
        self.end_at = end_at;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Never overlap: a fire arriving while a run is in progress is skipped.
    pub fn exclusive(mut self) -> Self {
        self.allow_concurrent = false;
        self
    }

    pub fn with_max_reentry(mut self, max_reentry: u32) -> Self {
        self.max_reentry = Some(max_reentry);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TickworkError::validation("trigger", "empty name"));
        }
        if let (Some(start), Some(end)) = (self.start_at, self.end_at) {
            if end < start {
                return Err(TickworkError::validation("trigger", "end_at is before start_at"));
            }
        }
        if let Schedule::FixedInterval { every_ms: 0 } = self.schedule {
            return Err(TickworkError::validation("trigger", "fixed interval must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cluster registry
// ---------------------------------------------------------------------------

/// One row of the instance registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerInstance {
    pub namespace: String,
    pub instance_name: InstanceName,
    pub last_heartbeat_at: DateTime<Utc>,
    pub heartbeat_interval_ms: u64,
    pub load_weight: f64,
    /// Standby instances heartbeat but never scan.
    pub standby: bool,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// One fire occurrence (or misfire skip) as recorded by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerLog {
    pub id: i64,
    pub namespace: String,
    /// `None` for manual runs.
    pub trigger_id: Option<TriggerId>,
    pub job_id: JobId,
    pub instance_name: InstanceName,
    /// Scheduled occurrence time.
    pub fire_at: DateTime<Utc>,
    /// When the occurrence was claimed.
    pub fired_at: DateTime<Utc>,
    pub misfired: bool,
    pub manual: bool,
    pub note: Option<String>,
}

/// One attempt of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub run_id: RunId,
    pub namespace: String,
    pub job_id: JobId,
    pub trigger_id: Option<TriggerId>,
    pub fire_at: DateTime<Utc>,
    /// 1-based.
    pub attempt: u32,
    pub instance_name: InstanceName,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl ExecutionLog {
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

/// Lifecycle or error event of a scheduler instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerLogEntry {
    pub id: i64,
    pub namespace: String,
    pub instance_name: InstanceName,
    pub event: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_payload() -> JobPayload {
        JobPayload::Shell(ShellJob {
            shell: ShellType::Sh,
            script: "echo hi".to_string(),
            env: BTreeMap::new(),
            working_dir: None,
        })
    }

    fn job_with(kind: JobKind, payload: JobPayload) -> Job {
        let now = Utc::now();
        Job {
            id: JobId(1),
            namespace: "default".to_string(),
            name: "j".to_string(),
            description: None,
            kind,
            payload,
            enabled: true,
            retry: RetryPolicy::none(),
            timeout_ms: 1_000,
            allow_concurrent: true,
            max_reentry: None,
            run_count: 0,
            last_run_at: None,
            last_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn payload_kind_mismatch_is_rejected() {
        let job = job_with(JobKind::Http, shell_payload());
        let err = job.validate().unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn matching_payload_validates() {
        assert!(job_with(JobKind::Shell, shell_payload()).validate().is_ok());
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let json = serde_json::to_value(shell_payload()).unwrap();
        assert_eq!(json["kind"], "shell");
        assert_eq!(json["shell"], "sh");

        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), JobKind::Shell);
    }

    #[test]
    fn http_payload_requires_http_url() {
        let payload = JobPayload::Http(HttpJob {
            method: "GET".to_string(),
            url: "ftp://example.com".to_string(),
            headers: BTreeMap::new(),
            body: None,
        });
        assert!(payload.validate().is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let b = Backoff {
            initial_ms: 100,
            multiplier: 2.0,
            max_ms: 500,
        };
        assert_eq!(b.delay_after(1), Duration::from_millis(100));
        assert_eq!(b.delay_after(2), Duration::from_millis(200));
        assert_eq!(b.delay_after(3), Duration::from_millis(400));
        assert_eq!(b.delay_after(4), Duration::from_millis(500));
        assert_eq!(b.delay_after(40), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_is_invalid() {
        let retry = RetryPolicy::attempts(0, Backoff::fixed(10));
        assert!(retry.validate().is_err());
    }

    #[test]
    fn patch_replacing_payload_updates_kind() {
        let mut job = job_with(JobKind::Shell, shell_payload());
        JobPatch {
            payload: Some(JobPayload::Procedure(ProcedureJob {
                name: "cleanup".to_string(),
                args: serde_json::Value::Null,
            })),
            ..Default::default()
        }
        .apply(&mut job);
        assert_eq!(job.kind, JobKind::Procedure);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn overlap_limit_follows_concurrency_settings() {
        let mut job = job_with(JobKind::Shell, shell_payload());
        assert_eq!(job.max_overlap(), None);
        job.max_reentry = Some(2);
        assert_eq!(job.max_overlap(), Some(3));
        job.allow_concurrent = false;
        assert_eq!(job.max_overlap(), Some(1));

        let new: NewJob = serde_json::from_str(
            r#"{"namespace":"default","name":"n","payload":{"kind":"shell","script":"true"}}"#,
        )
        .unwrap();
        assert!(new.allow_concurrent);
        assert_eq!(new.max_reentry, None);
    }

    #[test]
    fn misfire_policy_default_cap_is_unset() {
        let p: MisfirePolicy = serde_json::from_str(r#"{"policy":"fire_all_missed"}"#).unwrap();
        assert_eq!(p, MisfirePolicy::FireAllMissed { cap: None });
    }

    #[test]
    fn trigger_window_must_be_ordered() {
        let now = Utc::now();
        let t = NewTrigger::new(JobId(1), "t", Schedule::FixedInterval { every_ms: 1000 })
            .with_window(Some(now), Some(now - chrono::Duration::seconds(1)));
        assert!(t.validate().is_err());
    }

    #[test]
    fn kind_and_status_parse_round_trip() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert_eq!("timed_out".parse::<RunStatus>().unwrap(), RunStatus::TimedOut);
        assert!("nope".parse::<RunStatus>().is_err());
    }
}
