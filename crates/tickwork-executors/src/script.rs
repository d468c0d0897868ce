//! Script job executor backed by a fixed pool of embedded `rhai` engines.
//!
//! Engines are expensive to build, so a bounded pool hands them out behind an
//! RAII guard. The guard puts the engine back on drop, which covers success,
//! script errors, panics inside the blocking task and cancellation alike.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use tickwork_core::model::{JobKind, JobPayload};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{ExecutorError, Result};
use crate::output;
use crate::types::{Executor, JobContext, Outcome};

struct PooledEngine {
    engine: Engine,
    /// Loan currently holding the engine; bumped on every acquire.
    loan: Arc<AtomicU64>,
    /// Highest loan asked to abort. The progress callback stops the eval
    /// only when it matches the current loan, so a late cancel from an
    /// earlier borrower is inert.
    aborted: Arc<AtomicU64>,
}

impl PooledEngine {
    fn build(max_operations: u64) -> Self {
        let loan = Arc::new(AtomicU64::new(0));
        let aborted = Arc::new(AtomicU64::new(0));
        let mut engine = Engine::new();
        engine.set_max_operations(max_operations);
        let (current, stop) = (Arc::clone(&loan), Arc::clone(&aborted));
        engine.on_progress(move |_ops| {
            if stop.load(Ordering::Acquire) == current.load(Ordering::Acquire) {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
        Self { engine, loan, aborted }
    }
}

/// Aborts the evaluation of one loan and nothing after it.
#[derive(Clone)]
pub struct AbortHandle {
    aborted: Arc<AtomicU64>,
    loan: u64,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.aborted.fetch_max(self.loan, Ordering::AcqRel);
    }
}

/// Bounded pool of script engines.
pub struct EnginePool {
    idle: Mutex<Vec<PooledEngine>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl EnginePool {
    pub fn new(size: usize, max_operations: u64) -> Arc<Self> {
        let size = size.max(1);
        let idle = (0..size).map(|_| PooledEngine::build(max_operations)).collect();
        Arc::new(Self {
            idle: Mutex::new(idle),
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Engines not currently lent out.
    pub fn available(&self) -> usize {
        self.idle.lock().expect("engine pool poisoned").len()
    }

    /// Wait for a free engine.
    pub async fn acquire(self: &Arc<Self>) -> Result<EngineGuard> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Script("engine pool closed".to_string()))?;
        let engine = self
            .idle
            .lock()
            .expect("engine pool poisoned")
            .pop()
            .ok_or_else(|| ExecutorError::Script("engine pool exhausted".to_string()))?;
        let loan = engine.loan.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(EngineGuard {
            pool: Arc::clone(self),
            engine: Some(engine),
            loan,
            _permit: permit,
        })
    }
}

/// Exclusive loan of one engine. Returned to the pool on drop.
pub struct EngineGuard {
    pool: Arc<EnginePool>,
    engine: Option<PooledEngine>,
    loan: u64,
    // Declared last: released only after the engine is back in the pool.
    _permit: OwnedSemaphorePermit,
}

impl EngineGuard {
    fn pooled(&self) -> &PooledEngine {
        self.engine.as_ref().expect("engine present until drop")
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            aborted: Arc::clone(&self.pooled().aborted),
            loan: self.loan,
        }
    }

    /// Evaluate `source` with `args` bound as a variable of the same name.
    pub fn eval(&self, source: &str, args: &Value) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let mut scope = Scope::new();
        scope.push_dynamic("args", rhai::serde::to_dynamic(args)?);
        self.pooled().engine.eval_with_scope::<Dynamic>(&mut scope, source)
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            if let Ok(mut idle) = self.pool.idle.lock() {
                idle.push(engine);
            }
        }
    }
}

pub struct ScriptExecutor {
    pool: Arc<EnginePool>,
    max_output_chars: usize,
}

impl ScriptExecutor {
    pub fn new(pool: Arc<EnginePool>, max_output_chars: usize) -> Self {
        Self {
            pool,
            max_output_chars,
        }
    }

    fn render(&self, value: Dynamic) -> Result<Option<String>> {
        if value.is_unit() {
            return Ok(None);
        }
        let text = if value.is_string() {
            value.into_string().unwrap_or_default()
        } else {
            let json: Value = rhai::serde::from_dynamic(&value)
                .map_err(|e| ExecutorError::Script(e.to_string()))?;
            json.to_string()
        };
        Ok(output::non_empty(output::truncate_middle(&text, self.max_output_chars)))
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    fn name(&self) -> &'static str {
        "script"
    }

    fn supports(&self, kind: JobKind) -> bool {
        kind == JobKind::Script
    }

    async fn execute(&self, ctx: &JobContext) -> Outcome {
        let JobPayload::Script(job) = &ctx.job.payload else {
            return ExecutorError::PayloadMismatch {
                executor: "script",
                kind: ctx.job.kind,
            }
            .into();
        };

        let guard = tokio::select! {
            guard = self.pool.acquire() => match guard {
                Ok(g) => g,
                Err(e) => return e.into(),
            },
            _ = ctx.cancel.cancelled() => return Outcome::failure("cancelled"),
        };

        // Abort the evaluation as soon as the attempt is cancelled, even if
        // this future has already been dropped.
        let abort = guard.abort_handle();
        let cancel = ctx.cancel.clone();
        let watcher = tokio::spawn(async move {
            cancel.cancelled().await;
            abort.abort();
        });

        let source = job.source.clone();
        let args = job.args.clone();
        let joined = tokio::task::spawn_blocking(move || guard.eval(&source, &args)).await;
        watcher.abort();

        match joined {
            Ok(Ok(value)) => match self.render(value) {
                Ok(output) => Outcome::success(output),
                Err(e) => e.into(),
            },
            Ok(Err(err)) => match *err {
                EvalAltResult::ErrorTerminated(..) => Outcome::failure("cancelled"),
                EvalAltResult::ErrorTooManyOperations(..) => {
                    Outcome::failure("script exceeded its operation budget")
                }
                other => {
                    debug!(job_id = %ctx.job.id, "script error: {other}");
                    Outcome::failure(format!("script error: {other}"))
                }
            },
            Err(join) => Outcome::failure(format!("script task failed: {join}")),
        }
    }
}
