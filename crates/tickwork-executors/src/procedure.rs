//! In-process procedures: named async functions registered at startup and
//! invoked by `procedure` jobs.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tickwork_core::model::{JobKind, JobPayload};
use tracing::{debug, info};

use crate::error::{ExecutorError, Result};
use crate::output;
use crate::types::{Executor, JobContext, Outcome};

/// A unit of work callable by name from a procedure job.
#[async_trait]
pub trait Procedure: Send + Sync {
    /// The returned value becomes the run output (`null` means none).
    async fn call(&self, ctx: &JobContext, args: &Value) -> Result<Value>;
}

/// Adapter turning a plain closure into a [`Procedure`].
pub struct FnProcedure<F>(pub F);

#[async_trait]
impl<F> Procedure for FnProcedure<F>
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    async fn call(&self, _ctx: &JobContext, args: &Value) -> Result<Value> {
        (self.0)(args)
    }
}

/// Name → procedure map shared between the admin side and the executor.
#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: DashMap<String, Arc<dyn Procedure>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a procedure.
    pub fn register(&self, name: impl Into<String>, procedure: Arc<dyn Procedure>) {
        let name = name.into();
        if self.procedures.insert(name.clone(), procedure).is_some() {
            info!(name = %name, "procedure replaced");
        } else {
            debug!(name = %name, "procedure registered");
        }
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnProcedure(f)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.procedures.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Procedure>> {
        self.procedures.get(name).map(|p| Arc::clone(p.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.procedures.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

pub struct ProcedureExecutor {
    registry: Arc<ProcedureRegistry>,
    max_output_chars: usize,
}

impl ProcedureExecutor {
    pub fn new(registry: Arc<ProcedureRegistry>, max_output_chars: usize) -> Self {
        Self {
            registry,
            max_output_chars,
        }
    }

    fn render(&self, value: Value) -> Option<String> {
        let text = match value {
            Value::Null => return None,
            Value::String(s) => s,
            other => other.to_string(),
        };
        output::non_empty(output::truncate_middle(&text, self.max_output_chars))
    }
}

#[async_trait]
impl Executor for ProcedureExecutor {
    fn name(&self) -> &'static str {
        "procedure"
    }

    fn supports(&self, kind: JobKind) -> bool {
        kind == JobKind::Procedure
    }

    async fn execute(&self, ctx: &JobContext) -> Outcome {
        let JobPayload::Procedure(job) = &ctx.job.payload else {
            return ExecutorError::PayloadMismatch {
                executor: "procedure",
                kind: ctx.job.kind,
            }
            .into();
        };
        let Some(procedure) = self.registry.get(&job.name) else {
            return ExecutorError::ProcedureNotFound(job.name.clone()).into();
        };

        tokio::select! {
            result = procedure.call(ctx, &job.args) => match result {
                Ok(value) => Outcome::success(self.render(value)),
                Err(e) => e.into(),
            },
            _ = ctx.cancel.cancelled() => Outcome::failure("cancelled"),
        }
    }
}
