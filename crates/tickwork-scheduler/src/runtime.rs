//! Per-instance runtime: owns every scheduler component and the background
//! loops (heartbeat, scan, wheel tick, dispatch pump, log janitor).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tickwork_core::config::TickworkConfig;
use tickwork_core::types::InstanceName;
use tickwork_executors::ExecutorRegistry;
use tickwork_listeners::{ListenerBus, SchedulerEvent, SchedulerEventKind, TracingListener};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin::Admin;
use crate::clock::{Clock, SystemClock};
use crate::cluster::{ClusterCoordinator, PURGE_LOCK};
use crate::dispatch::{run_pump, Dispatcher, JobRunner};
use crate::error::Result;
use crate::log_listener::SchedulerLogListener;
use crate::scanner::{Fire, PendingFires, ScanSettings, Scanner};
use crate::store::Store;
use crate::wheel::WheelTimer;

/// Built-in listeners run before anything registered by the embedding
/// application.
const BUILTIN_PRIORITY: i32 = i32::MIN;

/// Rejected-fire reports waiting for the relay; further reports are dropped.
const ERROR_RELAY_DEPTH: usize = 64;

pub struct SchedulerRuntime {
    config: TickworkConfig,
    store: Arc<Store>,
    registry: Arc<ExecutorRegistry>,
    clock: Arc<dyn Clock>,
    bus: Arc<ListenerBus>,
}

impl SchedulerRuntime {
    pub fn new(config: TickworkConfig, store: Arc<Store>, registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            config,
            store,
            registry,
            clock: Arc::new(SystemClock),
            bus: Arc::new(ListenerBus::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register application listeners here before [`start`](Self::start).
    pub fn bus(&self) -> &Arc<ListenerBus> {
        &self.bus
    }

    /// Register this instance and spawn its loops. Must be called inside a
    /// tokio runtime.
    pub fn start(self) -> Result<SchedulerHandle> {
        let config = self.config;
        config.validate()?;
        let instance_name = config.instance_name();
        let namespace = config.scheduler.namespace.clone();

        let tracing_listener = Arc::new(TracingListener);
        self.bus
            .register_scheduler_listener("tracing", BUILTIN_PRIORITY, tracing_listener.clone());
        self.bus
            .register_trigger_listener("tracing", BUILTIN_PRIORITY, tracing_listener.clone());
        self.bus
            .register_job_listener("tracing", BUILTIN_PRIORITY, tracing_listener);
        self.bus.register_scheduler_listener(
            "scheduler_log",
            BUILTIN_PRIORITY,
            Arc::new(SchedulerLogListener::new(Arc::clone(&self.store))),
        );

        let coordinator = Arc::new(ClusterCoordinator::new(
            &config.scheduler,
            instance_name.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        ));
        let (dispatcher, queue) = Dispatcher::new(config.pool.queue_depth);
        let cancel = CancellationToken::new();
        let runner = Arc::new(JobRunner::new(
            &dispatcher,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.bus),
            Arc::clone(&self.clock),
            instance_name.clone(),
            cancel.clone(),
        ));

        let pending = Arc::new(PendingFires::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(run_pump(
            runner,
            queue,
            config.pool.workers,
            shutdown_rx.clone(),
        ))];

        let registered = config.scheduler.enabled;
        let started = if !config.scheduler.enabled {
            info!(namespace = %namespace, "scheduler disabled, only manual runs execute");
            SchedulerEventKind::Standby
        } else {
            coordinator.register()?;
            tasks.push(tokio::spawn(heartbeat_loop(
                Arc::clone(&coordinator),
                Arc::clone(&self.bus),
                shutdown_rx.clone(),
            )));

            if config.logs.retention_hours > 0 {
                tasks.push(tokio::spawn(janitor_loop(
                    Arc::clone(&coordinator),
                    Arc::clone(&self.clock),
                    Arc::clone(&self.bus),
                    config.logs.retention(),
                    config.logs.purge_interval(),
                    shutdown_rx.clone(),
                )));
            }

            if config.scheduler.standby {
                SchedulerEventKind::Standby
            } else {
                let wheel = Arc::new(WheelTimer::<Fire>::new(config.wheel.tick(), config.wheel.slots));
                let sink_dispatcher = dispatcher.clone();
                let (relay, relay_rx) = ErrorRelay::new(ERROR_RELAY_DEPTH);
                tasks.push(tokio::spawn(relay_errors(
                    relay_rx,
                    Arc::clone(&self.bus),
                    Arc::clone(&coordinator),
                )));
                tasks.push(tokio::spawn(Arc::clone(&wheel).run(
                    move |fire: Fire| {
                        if let Err(e) = sink_dispatcher.submit(fire) {
                            relay.report(e.to_string());
                        }
                    },
                    shutdown_rx.clone(),
                )));

                let scanner = Arc::new(Scanner::new(
                    Arc::clone(&coordinator),
                    Arc::clone(&self.clock),
                    Arc::clone(&self.bus),
                    wheel,
                    ScanSettings::from_config(&config),
                )
                .with_pending(Arc::clone(&pending)));
                tasks.push(tokio::spawn(scan_loop(
                    scanner,
                    Arc::clone(&coordinator),
                    Arc::clone(&self.bus),
                    config.scheduler.scan_interval(),
                    shutdown_rx.clone(),
                )));
                SchedulerEventKind::Started
            }
        };

        self.bus.emit_scheduler(&SchedulerEvent::new(
            namespace.as_str(),
            instance_name.clone(),
            started,
        ));

        let admin = Arc::new(Admin::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&coordinator),
            dispatcher,
        )
        .with_pending_fires(pending));
        Ok(SchedulerHandle {
            admin,
            bus: self.bus,
            coordinator,
            instance_name,
            registered,
            shutdown_tx,
            cancel,
            tasks,
        })
    }
}

/// Control handle of a started runtime.
pub struct SchedulerHandle {
    admin: Arc<Admin>,
    bus: Arc<ListenerBus>,
    coordinator: Arc<ClusterCoordinator>,
    instance_name: InstanceName,
    registered: bool,
    shutdown_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn admin(&self) -> Arc<Admin> {
        Arc::clone(&self.admin)
    }

    pub fn bus(&self) -> &Arc<ListenerBus> {
        &self.bus
    }

    pub fn instance_name(&self) -> &InstanceName {
        &self.instance_name
    }

    /// Stop every loop, cancel in-flight attempts, wait for them to wind
    /// down and leave the instance registry.
    pub async fn shutdown(self) {
        info!(instance = %self.instance_name, "scheduler shutting down");
        let _ = self.shutdown_tx.send(true);
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("scheduler task failed: {e}");
            }
        }
        if self.registered {
            if let Err(e) = self.coordinator.deregister() {
                warn!("deregistering instance failed: {e}");
            }
        }
        self.bus.emit_scheduler(&SchedulerEvent::new(
            self.coordinator.namespace(),
            self.instance_name.clone(),
            SchedulerEventKind::Stopped,
        ));
    }
}

fn emit_error(bus: &ListenerBus, coordinator: &ClusterCoordinator, context: &str, message: String) {
    error!(context, "{message}");
    emit_error_event(bus, coordinator, context, message);
}

fn emit_error_event(bus: &ListenerBus, coordinator: &ClusterCoordinator, context: &str, message: String) {
    bus.emit_scheduler(&SchedulerEvent::new(
        coordinator.namespace(),
        coordinator.instance_name().clone(),
        SchedulerEventKind::Error {
            context: context.to_string(),
            message,
        },
    ));
}

/// Reports dispatch rejections from the wheel tick. Listeners may write to
/// the store, so they run on [`relay_errors`] instead of the ticking task.
#[derive(Clone)]
struct ErrorRelay {
    tx: mpsc::Sender<String>,
}

impl ErrorRelay {
    fn new(depth: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Never waits.
    fn report(&self, message: String) {
        error!(context = "dispatch", "{message}");
        if self.tx.try_send(message).is_err() {
            debug!("error relay full, listener event dropped");
        }
    }
}

/// Deliver relayed errors to listeners off the async workers. Ends when
/// every [`ErrorRelay`] is dropped.
async fn relay_errors(mut rx: mpsc::Receiver<String>, bus: Arc<ListenerBus>, coordinator: Arc<ClusterCoordinator>) {
    while let Some(message) = rx.recv().await {
        let bus = Arc::clone(&bus);
        let coordinator = Arc::clone(&coordinator);
        let delivered = tokio::task::spawn_blocking(move || {
            emit_error_event(&bus, &coordinator, "dispatch", message);
        })
        .await;
        if let Err(e) = delivered {
            error!("error relay task failed: {e}");
        }
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run a blocking store-bound step off the async workers. Errors and panics
/// are reported and swallowed so the calling loop carries on.
async fn guarded<T, F>(bus: &ListenerBus, coordinator: &ClusterCoordinator, context: &str, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || std::panic::catch_unwind(AssertUnwindSafe(f))).await;
    match joined {
        Ok(Ok(Ok(value))) => Some(value),
        Ok(Ok(Err(e))) => {
            emit_error(bus, coordinator, context, e.to_string());
            None
        }
        Ok(Err(panic)) => {
            emit_error(bus, coordinator, context, format!("panicked: {}", panic_text(panic)));
            None
        }
        Err(e) => {
            emit_error(bus, coordinator, context, e.to_string());
            None
        }
    }
}

async fn heartbeat_loop(
    coordinator: Arc<ClusterCoordinator>,
    bus: Arc<ListenerBus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(coordinator.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let c = Arc::clone(&coordinator);
                guarded(&bus, &coordinator, "heartbeat", move || c.heartbeat()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn scan_loop(
    scanner: Arc<Scanner>,
    coordinator: Arc<ClusterCoordinator>,
    bus: Arc<ListenerBus>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(period_ms = period.as_millis() as u64, "trigger scanner started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let s = Arc::clone(&scanner);
                if let Some(report) = guarded(&bus, &coordinator, "scan", move || s.scan_once()).await {
                    if report.lock_busy {
                        debug!("scan lock held elsewhere, cycle skipped");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("trigger scanner shutting down");
                    break;
                }
            }
        }
    }
}

async fn janitor_loop(
    coordinator: Arc<ClusterCoordinator>,
    clock: Arc<dyn Clock>,
    bus: Arc<ListenerBus>,
    retention: Duration,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let retention = ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::MAX);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let c = Arc::clone(&coordinator);
                let cutoff = clock
                    .now()
                    .checked_sub_signed(retention)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let purged = guarded(&bus, &coordinator, "log purge", move || {
                    let namespace = c.namespace().to_string();
                    c.try_acquire_lock(PURGE_LOCK, |tx| Store::purge_logs(tx, &namespace, cutoff))
                })
                .await;
                if let Some(Some(counts)) = purged {
                    if counts.total() > 0 {
                        info!(
                            trigger_logs = counts.trigger_logs,
                            execution_logs = counts.execution_logs,
                            scheduler_logs = counts.scheduler_logs,
                            "old logs purged"
                        );
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tickwork_core::config::SchedulerConfig;
    use tickwork_listeners::SchedulerListener;

    /// Blocks each delivery, standing in for a listener stuck on the store.
    struct SlowListener {
        seen: Mutex<Vec<String>>,
    }

    impl SchedulerListener for SlowListener {
        fn on_scheduler_event(&self, event: &SchedulerEvent) -> tickwork_listeners::Result<()> {
            std::thread::sleep(Duration::from_millis(100));
            if let SchedulerEventKind::Error { message, .. } = &event.kind {
                self.seen.lock().unwrap().push(message.clone());
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_fire_report_never_waits_on_listeners() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let coordinator = Arc::new(ClusterCoordinator::new(
            &SchedulerConfig::default(),
            InstanceName::from("relay"),
            store,
            Arc::new(SystemClock),
        ));
        let bus = Arc::new(ListenerBus::new());
        let listener = Arc::new(SlowListener {
            seen: Mutex::new(Vec::new()),
        });
        bus.register_scheduler_listener("slow", 0, listener.clone());

        let (relay, rx) = ErrorRelay::new(2);
        let relayer = tokio::spawn(relay_errors(rx, Arc::clone(&bus), coordinator));

        let started = std::time::Instant::now();
        for i in 0..10 {
            relay.report(format!("rejected {i}"));
        }
        assert!(started.elapsed() < Duration::from_millis(50), "report blocked");

        drop(relay);
        relayer.await.unwrap();
        let seen = listener.seen.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert!(seen.len() < 10, "overflowing reports are dropped");
        assert_eq!(seen[0], "rejected 0");
    }
}
