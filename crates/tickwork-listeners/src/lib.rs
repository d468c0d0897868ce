//! Listener Bus: ordered, failure-isolated observer chains for scheduler
//! lifecycle, trigger fire/misfire and job run events.

pub mod bus;
pub mod error;
pub mod tracing_listener;
pub mod types;

pub use bus::ListenerBus;
pub use error::{ListenerError, Result};
pub use tracing_listener::TracingListener;
pub use types::{
    JobEvent, JobListener, SchedulerEvent, SchedulerEventKind, SchedulerListener, TriggerEvent,
    TriggerListener,
};
