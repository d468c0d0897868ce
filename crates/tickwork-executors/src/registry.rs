use std::sync::{Arc, RwLock};

use tickwork_core::config::ExecutorsConfig;
use tickwork_core::model::JobKind;
use tracing::debug;

use crate::http::HttpExecutor;
use crate::procedure::{ProcedureExecutor, ProcedureRegistry};
use crate::script::{EnginePool, ScriptExecutor};
use crate::shell::ShellExecutor;
use crate::types::Executor;

/// Ordered executor lookup. The first registered executor supporting a kind
/// wins, so custom executors registered before the defaults override them.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<Vec<Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in executors, configured from `[executors]`.
    pub fn with_defaults(config: &ExecutorsConfig, procedures: Arc<ProcedureRegistry>) -> Self {
        let registry = Self::new();
        registry.register_defaults(config, procedures);
        registry
    }

    /// Append the built-in executors after anything already registered.
    pub fn register_defaults(&self, config: &ExecutorsConfig, procedures: Arc<ProcedureRegistry>) {
        let max = config.max_output_chars;
        self.register(Arc::new(HttpExecutor::new(max)));
        self.register(Arc::new(ProcedureExecutor::new(procedures, max)));
        self.register(Arc::new(ScriptExecutor::new(
            EnginePool::new(config.script_engines, config.script_max_operations),
            max,
        )));
        self.register(Arc::new(ShellExecutor::new(max)));
    }

    pub fn register(&self, executor: Arc<dyn Executor>) {
        debug!(executor = executor.name(), "executor registered");
        self.executors
            .write()
            .expect("executor registry poisoned")
            .push(executor);
    }

    pub fn find(&self, kind: JobKind) -> Option<Arc<dyn Executor>> {
        self.executors
            .read()
            .expect("executor registry poisoned")
            .iter()
            .find(|e| e.supports(kind))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.executors.read().expect("executor registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobContext, Outcome};
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Executor for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn supports(&self, kind: JobKind) -> bool {
            kind == JobKind::Shell
        }

        async fn execute(&self, _ctx: &JobContext) -> Outcome {
            Outcome::success(None)
        }
    }

    #[test]
    fn first_supporting_executor_wins() {
        let registry = ExecutorRegistry::new();
        registry.register(Arc::new(Named("custom")));
        registry.register_defaults(&ExecutorsConfig::default(), Arc::new(ProcedureRegistry::new()));

        assert_eq!(registry.find(JobKind::Shell).unwrap().name(), "custom");
        assert_eq!(registry.find(JobKind::Http).unwrap().name(), "http");
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn empty_registry_finds_nothing() {
        let registry = ExecutorRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.find(JobKind::Script).is_none());
    }
}
