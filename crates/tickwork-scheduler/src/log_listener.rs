use std::sync::Arc;

use tickwork_listeners::{ListenerError, SchedulerEvent, SchedulerEventKind, SchedulerListener};

use crate::store::Store;

/// Persists scheduler lifecycle and error events to `scheduler_logs`.
pub struct SchedulerLogListener {
    store: Arc<Store>,
}

impl SchedulerLogListener {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl SchedulerListener for SchedulerLogListener {
    fn on_scheduler_event(&self, event: &SchedulerEvent) -> tickwork_listeners::Result<()> {
        let detail = match &event.kind {
            SchedulerEventKind::Error { context, message } => Some(format!("{context}: {message}")),
            _ => None,
        };
        self.store
            .insert_scheduler_log(
                &event.namespace,
                &event.instance_name,
                event.kind.name(),
                detail.as_deref(),
                event.at,
            )
            .map_err(ListenerError::failed)
    }
}
