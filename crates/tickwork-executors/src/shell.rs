//! Shell job executor: runs a script through bash, sh, python or node.

use std::process::Stdio;

use async_trait::async_trait;
use tickwork_core::model::{JobKind, JobPayload, ShellJob};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ExecutorError, Result};
use crate::output;
use crate::types::{Executor, JobContext, Outcome};

pub struct ShellExecutor {
    max_output_chars: usize,
}

impl ShellExecutor {
    pub fn new(max_output_chars: usize) -> Self {
        Self { max_output_chars }
    }

    fn command(&self, job: &ShellJob, ctx: &JobContext) -> Command {
        let (program, leading) = job.shell.command();
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg(&job.script)
            .envs(&job.env)
            .env("TICKWORK_JOB_ID", ctx.job.id.to_string())
            .env("TICKWORK_RUN_ID", ctx.run_id.to_string())
            .env("TICKWORK_ATTEMPT", ctx.attempt.to_string())
            .env("TICKWORK_FIRE_AT", ctx.fire_at.to_rfc3339())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &job.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so a kill also reaches anything the script forked.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn run(&self, job: &ShellJob, ctx: &JobContext) -> Result<Outcome> {
        let child = self
            .command(job, ctx)
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", job.shell.command().0)))?;

        // Armed until the child has been reaped. Dropping this future (timeout)
        // or cancellation kills the whole process group.
        let mut guard = ProcessGuard::new(child.id());
        debug!(job_id = %ctx.job.id, pid = ?child.id(), "shell job spawned");

        let out = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = ctx.cancel.cancelled() => {
                return Ok(Outcome::failure("cancelled"));
            }
        };
        guard.disarm();

        let stdout = output::clean_bytes(&out.stdout, self.max_output_chars);
        if out.status.success() {
            return Ok(Outcome::success(output::non_empty(stdout)));
        }

        let stderr = output::clean_bytes(&out.stderr, self.max_output_chars);
        let detail = if stderr.is_empty() { stdout } else { stderr };
        let reason = match out.status.code() {
            Some(code) => format!("exit code {code}: {detail}"),
            None => format!("terminated by signal: {detail}"),
        };
        Ok(Outcome::failure(reason.trim_end()))
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn supports(&self, kind: JobKind) -> bool {
        kind == JobKind::Shell
    }

    async fn execute(&self, ctx: &JobContext) -> Outcome {
        let JobPayload::Shell(job) = &ctx.job.payload else {
            return ExecutorError::PayloadMismatch {
                executor: "shell",
                kind: ctx.job.kind,
            }
            .into();
        };
        self.run(job, ctx).await.unwrap_or_else(Outcome::from)
    }
}

/// Sends SIGKILL to the child's process group on drop unless disarmed.
struct ProcessGuard {
    pid: Option<u32>,
}

impl ProcessGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let Some(raw_pid) = self.pid.take() else {
            return;
        };
        warn!(pid = raw_pid, "killing unfinished shell job");
        // Safety: raw_pid leads the process group created at spawn time and
        // has not been reaped yet.
        #[cfg(unix)]
        unsafe {
            libc::kill(-(raw_pid as libc::pid_t), libc::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &raw_pid.to_string()])
                .output();
        }
    }
}
