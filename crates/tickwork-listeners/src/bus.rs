use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tickwork_core::model::RunStatus;
use tracing::{debug, error};

use crate::error::Result;
use crate::types::{
    JobEvent, JobListener, SchedulerEvent, SchedulerListener, TriggerEvent, TriggerListener,
};

struct Registration<L: ?Sized> {
    name: String,
    /// Lower value = earlier execution. Ties broken by registration order.
    priority: i32,
    listener: Arc<L>,
}

/// One ordered callback chain.
struct Chain<L: ?Sized> {
    entries: RwLock<Vec<Registration<L>>>,
}

impl<L: ?Sized> Chain<L> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn register(&self, name: String, priority: i32, listener: Arc<L>) {
        let mut entries = self.entries.write().expect("listener chain poisoned");
        entries.push(Registration {
            name,
            priority,
            listener,
        });
        // Stable sort preserves registration order within the same priority.
        entries.sort_by_key(|r| r.priority);
    }

    fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write().expect("listener chain poisoned");
        let before = entries.len();
        entries.retain(|r| r.name != name);
        entries.len() < before
    }

    /// Cloned out so callbacks run without the lock held.
    fn snapshot(&self) -> Vec<(String, Arc<L>)> {
        let entries = self.entries.read().expect("listener chain poisoned");
        entries
            .iter()
            .map(|r| (r.name.clone(), Arc::clone(&r.listener)))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.read().expect("listener chain poisoned").len()
    }

    /// Invoke `f` on every listener in order. Returns how many failed.
    fn emit(&self, callback: &'static str, f: impl Fn(&L) -> Result<()>) -> usize {
        let mut failures = 0;
        for (name, listener) in self.snapshot() {
            let t = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| f(listener.as_ref())));
            let elapsed_ms = t.elapsed().as_millis() as u64;

            match outcome {
                Ok(Ok(())) => {
                    debug!(listener = %name, callback, duration_ms = elapsed_ms, "listener completed");
                }
                Ok(Err(e)) => {
                    failures += 1;
                    error!(listener = %name, callback, "listener returned error: {e}");
                }
                Err(panic) => {
                    failures += 1;
                    error!(
                        listener = %name,
                        callback,
                        "listener panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        failures
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Ordered listener chains for scheduler, trigger and job events.
///
/// One bus per scheduler instance, shared as `Arc<ListenerBus>`. Every
/// callback is isolated: an `Err` or a panic is logged and the remaining
/// listeners still run. `emit_*` methods return the failure count for tests
/// and diagnostics; callers are free to ignore it.
pub struct ListenerBus {
    scheduler: Chain<dyn SchedulerListener>,
    trigger: Chain<dyn TriggerListener>,
    job: Chain<dyn JobListener>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self {
            scheduler: Chain::new(),
            trigger: Chain::new(),
            job: Chain::new(),
        }
    }

    pub fn register_scheduler_listener(
        &self,
        name: impl Into<String>,
        priority: i32,
        listener: Arc<dyn SchedulerListener>,
    ) {
        let name = name.into();
        debug!(name = %name, priority, "scheduler listener registered");
        self.scheduler.register(name, priority, listener);
    }

    pub fn register_trigger_listener(
        &self,
        name: impl Into<String>,
        priority: i32,
        listener: Arc<dyn TriggerListener>,
    ) {
        let name = name.into();
        debug!(name = %name, priority, "trigger listener registered");
        self.trigger.register(name, priority, listener);
    }

    pub fn register_job_listener(
        &self,
        name: impl Into<String>,
        priority: i32,
        listener: Arc<dyn JobListener>,
    ) {
        let name = name.into();
        debug!(name = %name, priority, "job listener registered");
        self.job.register(name, priority, listener);
    }

    /// Remove every registration with this name from all chains.
    /// Returns false if nothing matched.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = [
            self.scheduler.unregister(name),
            self.trigger.unregister(name),
            self.job.unregister(name),
        ]
        .contains(&true);
        if removed {
            debug!(name, "listener unregistered");
        }
        removed
    }

    /// Total registrations across the three chains.
    pub fn len(&self) -> usize {
        self.scheduler.len() + self.trigger.len() + self.job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit_scheduler(&self, event: &SchedulerEvent) -> usize {
        self.scheduler
            .emit("on_scheduler_event", |l| l.on_scheduler_event(event))
    }

    pub fn emit_trigger_fired(&self, event: &TriggerEvent) -> usize {
        self.trigger.emit("trigger_fired", |l| l.trigger_fired(event))
    }

    pub fn emit_trigger_misfired(&self, event: &TriggerEvent) -> usize {
        self.trigger.emit("trigger_misfired", |l| l.trigger_misfired(event))
    }

    pub fn emit_job_started(&self, event: &JobEvent) -> usize {
        self.job.emit("job_started", |l| l.job_started(event))
    }

    pub fn emit_job_retrying(&self, event: &JobEvent, reason: &str) -> usize {
        self.job.emit("job_retrying", |l| l.job_retrying(event, reason))
    }

    pub fn emit_job_succeeded(&self, event: &JobEvent, output: Option<&str>) -> usize {
        self.job.emit("job_succeeded", |l| l.job_succeeded(event, output))
    }

    pub fn emit_job_failed(&self, event: &JobEvent, status: RunStatus, reason: &str) -> usize {
        self.job
            .emit("job_failed", |l| l.job_failed(event, status, reason))
    }
}

impl Default for ListenerBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ListenerError;
    use crate::types::SchedulerEventKind;
    use std::sync::Mutex;
    use tickwork_core::types::InstanceName;

    /// Appends its label to a shared log on every scheduler event.
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl SchedulerListener for Recorder {
        fn on_scheduler_event(&self, _event: &SchedulerEvent) -> Result<()> {
            self.log.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    struct Failing;

    impl SchedulerListener for Failing {
        fn on_scheduler_event(&self, _event: &SchedulerEvent) -> Result<()> {
            Err(ListenerError::failed("boom"))
        }
    }

    struct Panicking;

    impl SchedulerListener for Panicking {
        fn on_scheduler_event(&self, _event: &SchedulerEvent) -> Result<()> {
            panic!("listener bug");
        }
    }

    fn event() -> SchedulerEvent {
        SchedulerEvent::new("default", InstanceName::from("a"), SchedulerEventKind::Started)
    }

    fn recorder(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            label,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn lower_priority_runs_first_and_ties_keep_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = ListenerBus::new();
        bus.register_scheduler_listener("late", 10, recorder("late", &log));
        bus.register_scheduler_listener("first-tie", 0, recorder("first-tie", &log));
        bus.register_scheduler_listener("second-tie", 0, recorder("second-tie", &log));
        bus.register_scheduler_listener("early", -5, recorder("early", &log));

        assert_eq!(bus.emit_scheduler(&event()), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["early", "first-tie", "second-tie", "late"]
        );
    }

    #[test]
    fn failing_and_panicking_listeners_do_not_stop_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = ListenerBus::new();
        bus.register_scheduler_listener("before", 0, recorder("before", &log));
        bus.register_scheduler_listener("err", 1, Arc::new(Failing));
        bus.register_scheduler_listener("panic", 2, Arc::new(Panicking));
        bus.register_scheduler_listener("after", 3, recorder("after", &log));

        assert_eq!(bus.emit_scheduler(&event()), 2);
        assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);
    }

    #[test]
    fn unregister_removes_by_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = ListenerBus::new();
        bus.register_scheduler_listener("a", 0, recorder("a", &log));
        bus.register_scheduler_listener("b", 0, recorder("b", &log));

        assert!(bus.unregister("a"));
        assert!(!bus.unregister("a"));
        bus.emit_scheduler(&event());
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn empty_bus_emits_nothing() {
        let bus = ListenerBus::default();
        assert!(bus.is_empty());
        assert_eq!(bus.emit_scheduler(&event()), 0);
    }
}
