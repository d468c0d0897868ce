//! Hashed timing wheel with round counters.
//!
//! N buckets, one tick each. A task with delay `d`, scheduled `s` after the
//! last tick boundary, lands in bucket `(cursor + ticks) mod N` where
//! `ticks = max(1, ceil((s + d) / tick))` and waits `rounds = (ticks - 1) / N`
//! full revolutions there, so it never runs before its deadline. Cancellation
//! is a lazy tombstone: the entry stays in its bucket and is dropped when
//! reached.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

const PENDING: u8 = 0;
const EXPIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Cancellation handle for one scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    /// Cancel the task if it has not fired yet. Returns `false` when it has
    /// already fired or was already cancelled.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXPIRED
    }
}

struct Entry<T> {
    task: T,
    rounds: u64,
    state: Arc<AtomicU8>,
}

/// Single-threaded wheel. Wrap in [`WheelTimer`] for shared use.
pub struct TimingWheel<T> {
    buckets: Vec<Vec<Entry<T>>>,
    cursor: usize,
    tick: Duration,
    pending: usize,
    advanced: u64,
}

impl<T> TimingWheel<T> {
    pub fn new(tick: Duration, slots: usize) -> Self {
        assert!(!tick.is_zero(), "wheel tick must be > 0");
        assert!(slots > 0, "wheel needs at least one slot");
        Self {
            buckets: (0..slots).map(|_| Vec::new()).collect(),
            cursor: 0,
            tick,
            pending: 0,
            advanced: 0,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn slots(&self) -> usize {
        self.buckets.len()
    }

    /// Entries still in buckets, including cancelled ones not yet reached.
    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Ticks advanced since creation.
    pub fn advanced(&self) -> u64 {
        self.advanced
    }

    /// Schedule `task` `delay` after the current tick boundary.
    pub fn schedule(&mut self, task: T, delay: Duration) -> TimerHandle {
        self.schedule_after(task, delay, Duration::ZERO)
    }

    /// Schedule `task` `delay` from now, where `now` lies `into_tick` past the
    /// current tick boundary.
    pub fn schedule_after(&mut self, task: T, delay: Duration, into_tick: Duration) -> TimerHandle {
        let tick_ns = self.tick.as_nanos();
        let ticks = (into_tick.as_nanos() + delay.as_nanos())
            .div_ceil(tick_ns)
            .max(1) as u64;
        let n = self.buckets.len() as u64;
        let index = ((self.cursor as u64 + ticks) % n) as usize;
        let rounds = (ticks - 1) / n;

        let state = Arc::new(AtomicU8::new(PENDING));
        self.buckets[index].push(Entry {
            task,
            rounds,
            state: Arc::clone(&state),
        });
        self.pending += 1;
        TimerHandle { state }
    }

    /// Move one tick forward and release every task due in the new bucket.
    pub fn advance(&mut self) -> Vec<T> {
        self.cursor = (self.cursor + 1) % self.buckets.len();
        self.advanced += 1;
        let bucket = std::mem::take(&mut self.buckets[self.cursor]);
        let mut due = Vec::new();

        for mut entry in bucket {
            if entry.state.load(Ordering::Acquire) == CANCELLED {
                self.pending -= 1;
                continue;
            }
            if entry.rounds > 0 {
                entry.rounds -= 1;
                self.buckets[self.cursor].push(entry);
                continue;
            }
            self.pending -= 1;
            // Lost race with cancel(): the tombstone wins.
            if entry
                .state
                .compare_exchange(PENDING, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                due.push(entry.task);
            }
        }
        due
    }
}

/// Thread-safe wheel plus its tokio driver.
///
/// Tick `k` is due at `origin + k * tick`; the driver keeps that grid, so
/// the position inside the current tick is known when scheduling.
pub struct WheelTimer<T> {
    wheel: Mutex<TimingWheel<T>>,
    tick: Duration,
    origin: Instant,
}

impl<T: Send + 'static> WheelTimer<T> {
    pub fn new(tick: Duration, slots: usize) -> Self {
        Self {
            wheel: Mutex::new(TimingWheel::new(tick, slots)),
            tick,
            origin: Instant::now(),
        }
    }

    pub fn schedule(&self, task: T, delay: Duration) -> TimerHandle {
        let mut wheel = self.wheel.lock().expect("timing wheel poisoned");
        let elapsed = Instant::now().saturating_duration_since(self.origin).as_nanos();
        let boundary = self.tick.as_nanos() * u128::from(wheel.advanced());
        let into_tick = Duration::from_nanos(elapsed.saturating_sub(boundary).min(u64::MAX as u128) as u64);
        wheel.schedule_after(task, delay, into_tick)
    }

    pub fn len(&self) -> usize {
        self.wheel.lock().expect("timing wheel poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance once per tick until `shutdown` flips to true, handing every
    /// released task to `sink`. The sink must not block: it runs on the
    /// ticking task.
    pub async fn run(self: Arc<Self>, sink: impl Fn(T) + Send, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.tick.as_millis() as u64, "timing wheel started");
        let mut ticker = interval_at(self.origin + self.tick, self.tick);
        // A late tick still has to release its bucket; catch up tick by tick.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let due = self.wheel.lock().expect("timing wheel poisoned").advance();
                    if !due.is_empty() {
                        debug!(count = due.len(), "wheel released tasks");
                    }
                    for task in due {
                        sink(task);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("timing wheel shutting down");
                        break;
                    }
                }
            }
        }
    }
}
