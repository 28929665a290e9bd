//! Counters, timers and gauges emitted by the processing pipeline.
//!
//! Every component holds a cheap [`Stats`] clone and records through it.
//! Recording never blocks and never fails: values land in lock-free
//! atomics, and an optional [`StatsSink`] observer is invoked
//! fire-and-forget. A sink that cannot deliver must swallow or log the
//! problem itself; nothing propagates back into message processing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Names of the counters and gauges the pipeline emits.
pub mod names {
    /// Messages processed successfully
    pub const PROCESSED_SUCCESS: &str = "processed.success";
    /// Handler invocations that failed
    pub const PROCESSED_FAILURE: &str = "processed.failure";
    /// Messages dead-lettered after exhausting retries
    pub const PROCESSED_DEAD: &str = "processed.dead";
    /// Retries handed back to the queue
    pub const RETRY_SCHEDULED: &str = "retry.scheduled";
    /// Current queue depth
    pub const QUEUE_DEPTH: &str = "queue.depth";
    /// Handler invocation latency
    pub const HANDLER_DURATION: &str = "handler.duration";
}

/// External observer for recorded values.
///
/// Implementations must be best-effort: they are called inline on the
/// recording path and must not block or panic.
pub trait StatsSink: Send + Sync {
    /// A counter was incremented by `value`.
    fn on_counter(&self, name: &str, value: u64);
    /// A duration was recorded.
    fn on_timer(&self, name: &str, duration: Duration);
    /// A gauge was set.
    fn on_gauge(&self, name: &str, value: i64);
}

#[derive(Default)]
struct TimerCell {
    count: AtomicU64,
    total_nanos: AtomicU64,
}

#[derive(Default)]
struct StatsInner {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<HashMap<String, Arc<AtomicI64>>>,
    timers: RwLock<HashMap<String, Arc<TimerCell>>>,
}

/// Shared meter handed to every component.
#[derive(Clone, Default)]
pub struct Stats {
    inner: Arc<StatsInner>,
    sink: Option<Arc<dyn StatsSink>>,
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stats")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Stats {
    /// Create a meter with no external sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a meter that forwards every recording to `sink`.
    pub fn with_sink(sink: Arc<dyn StatsSink>) -> Self {
        Self {
            inner: Arc::new(StatsInner::default()),
            sink: Some(sink),
        }
    }

    /// Get (registering on first use) the counter `name`.
    pub fn counter(&self, name: &str) -> Counter {
        let cell = {
            let read = self.inner.counters.read().unwrap_or_else(|e| e.into_inner());
            read.get(name).cloned()
        };
        let cell = cell.unwrap_or_else(|| {
            let mut write = self
                .inner
                .counters
                .write()
                .unwrap_or_else(|e| e.into_inner());
            Arc::clone(write.entry(name.to_string()).or_default())
        });
        Counter {
            name: name.to_string(),
            cell,
            sink: self.sink.clone(),
        }
    }

    /// Get (registering on first use) the timer `name`.
    pub fn timer(&self, name: &str) -> Timer {
        let cell = {
            let read = self.inner.timers.read().unwrap_or_else(|e| e.into_inner());
            read.get(name).cloned()
        };
        let cell = cell.unwrap_or_else(|| {
            let mut write = self.inner.timers.write().unwrap_or_else(|e| e.into_inner());
            Arc::clone(write.entry(name.to_string()).or_default())
        });
        Timer {
            name: name.to_string(),
            cell,
            sink: self.sink.clone(),
        }
    }

    /// Get (registering on first use) the gauge `name`.
    pub fn gauge(&self, name: &str) -> Gauge {
        let cell = {
            let read = self.inner.gauges.read().unwrap_or_else(|e| e.into_inner());
            read.get(name).cloned()
        };
        let cell = cell.unwrap_or_else(|| {
            let mut write = self.inner.gauges.write().unwrap_or_else(|e| e.into_inner());
            Arc::clone(write.entry(name.to_string()).or_default())
        });
        Gauge {
            name: name.to_string(),
            cell,
            sink: self.sink.clone(),
        }
    }

    /// Snapshot of all recorded values.
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self
            .inner
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .inner
            .gauges
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        let timers = self
            .inner
            .timers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    TimerSnapshot {
                        count: v.count.load(Ordering::Relaxed),
                        total: Duration::from_nanos(v.total_nanos.load(Ordering::Relaxed)),
                    },
                )
            })
            .collect();
        StatsSnapshot {
            counters,
            gauges,
            timers,
        }
    }
}

/// Handle to a single counter.
pub struct Counter {
    name: String,
    cell: Arc<AtomicU64>,
    sink: Option<Arc<dyn StatsSink>>,
}

impl Counter {
    /// Increment the counter by `n`.
    pub fn increment(&self, n: u64) {
        self.cell.fetch_add(n, Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            sink.on_counter(&self.name, n);
        }
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }
}

/// Handle to a single timer.
pub struct Timer {
    name: String,
    cell: Arc<TimerCell>,
    sink: Option<Arc<dyn StatsSink>>,
}

impl Timer {
    /// Record one observation.
    pub fn record(&self, duration: Duration) {
        self.cell.count.fetch_add(1, Ordering::Relaxed);
        self.cell
            .total_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            sink.on_timer(&self.name, duration);
        }
    }
}

/// Handle to a single gauge.
pub struct Gauge {
    name: String,
    cell: Arc<AtomicI64>,
    sink: Option<Arc<dyn StatsSink>>,
}

impl Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: i64) {
        self.cell.store(value, Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            sink.on_gauge(&self.name, value);
        }
    }

    /// Current gauge value.
    pub fn value(&self) -> i64 {
        self.cell.load(Ordering::Relaxed)
    }
}

/// Aggregated view of a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSnapshot {
    /// Number of observations
    pub count: u64,
    /// Sum of all observed durations
    pub total: Duration,
}

/// Point-in-time view of all recorded values.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Counter values by name
    pub counters: HashMap<String, u64>,
    /// Gauge values by name
    pub gauges: HashMap<String, i64>,
    /// Timer aggregates by name
    pub timers: HashMap<String, TimerSnapshot>,
}

impl StatsSnapshot {
    /// Counter value, zero when never recorded.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Gauge value, zero when never recorded.
    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges.get(name).copied().unwrap_or(0)
    }
}
