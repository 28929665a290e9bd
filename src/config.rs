//! Configuration types for sphereq.
//!
//! This module contains all configuration structures used throughout
//! sphereq, including worker settings, queue behaviour, retry policy,
//! storage backend selection and logging.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for sphereq.
///
/// # Examples
///
/// ```rust
/// use sphereq::config::{SphereConfig, WorkerConfig, QueueConfig};
///
/// // Use default configuration
/// let config = SphereConfig::default();
///
/// // Custom configuration
/// let config = SphereConfig {
///     workers: WorkerConfig {
///         num_workers: 8,
///         ..Default::default()
///     },
///     queue: QueueConfig {
///         capacity: 10_000,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SphereConfig {
    /// Worker pool configuration
    pub workers: WorkerConfig,

    /// Queue behaviour configuration
    pub queue: QueueConfig,

    /// Retry policy applied to failed messages
    pub retry: RetryPolicy,

    /// Durable storage backend configuration
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of workers to spawn
    pub num_workers: usize,

    /// How long a worker waits on an empty queue before re-checking
    /// for drain (in milliseconds)
    pub poll_timeout_ms: u64,

    /// Maximum time a handler invocation may run before being
    /// cancelled and treated as a failure (in seconds; None = no
    /// limit)
    pub handler_timeout_secs: Option<u64>,

    /// Default time to wait for in-flight work during drain (in seconds)
    pub drain_timeout_secs: u64,

    /// Interval between health log lines (in seconds)
    pub health_check_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            poll_timeout_ms: 500,
            handler_timeout_secs: Some(300), // 5 minutes
            drain_timeout_secs: 30,
            health_check_interval_secs: 30,
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration with a specific number of workers.
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Set the handler timeout.
    pub fn with_handler_timeout(mut self, timeout_secs: u64) -> Self {
        self.handler_timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the drain timeout.
    pub fn with_drain_timeout(mut self, timeout_secs: u64) -> Self {
        self.drain_timeout_secs = timeout_secs;
        self
    }
}

/// What a producer-facing enqueue does once capacity is reached.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnqueueMode {
    /// Block until a dequeue frees capacity
    #[default]
    Blocking,
    /// Return `SphereError::QueueFull` immediately
    FailFast,
}

/// How a retried message is ordered among other eligible work.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RetryOrdering {
    /// Retries compete fresh: ordered by re-admission time
    #[default]
    Fresh,
    /// Retries keep their original enqueue-order priority
    PreserveOriginal,
}

/// Queue behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued entries (0 = unbounded)
    pub capacity: usize,

    /// Backpressure behaviour once capacity is reached
    pub enqueue_mode: EnqueueMode,

    /// Ordering policy for retried messages
    pub retry_ordering: RetryOrdering,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 0, // unbounded
            enqueue_mode: EnqueueMode::Blocking,
            retry_ordering: RetryOrdering::Fresh,
        }
    }
}

impl QueueConfig {
    /// Set the queue capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the backpressure mode.
    pub fn with_enqueue_mode(mut self, mode: EnqueueMode) -> Self {
        self.enqueue_mode = mode;
        self
    }

    /// Set the retry ordering policy.
    pub fn with_retry_ordering(mut self, ordering: RetryOrdering) -> Self {
        self.retry_ordering = ordering;
        self
    }
}

/// Retry policy applied per processing pipeline, consulted per message
/// using its attempt counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of execution attempts before dead-lettering
    pub max_attempts: u32,

    /// Base delay before the first retry (in milliseconds)
    pub base_delay_ms: u64,

    /// Upper bound for any single retry delay (in milliseconds)
    pub max_delay_ms: u64,

    /// Exponential growth factor applied per attempt (>= 1.0)
    pub multiplier: f64,

    /// Fraction of the delay used for uniform jitter, in [0, 1]
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000, // 30 seconds
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with the default delays.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Fixed delay between attempts, no jitter.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_fraction: 0.0,
        }
    }

    /// Disable retries: the first failure dead-letters the message.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Disable jitter, keeping the delays deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_fraction = 0.0;
        self
    }

    /// Backoff delay before the retry following attempt number
    /// `attempt` (1-based), before jitter is applied.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exp as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Durable storage backend selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum StorageBackend {
    /// In-memory store: state survives only for the process lifetime.
    /// Intended for development and tests.
    #[default]
    Memory,
    /// Append-only journal file, replayed on startup
    Journal {
        /// Path of the journal file
        path: String,
    },
}

/// Durable storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which backend to use
    pub backend: StorageBackend,
}

impl StorageConfig {
    /// In-memory storage.
    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
        }
    }

    /// Journal-file storage at `path`.
    pub fn journal(path: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::Journal { path: path.into() },
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Install a global tracing subscriber matching `config`.
///
/// Returns an error string if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), String> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(config.level))
        .with_ansi(config.colored && !config.json_format)
        .with_target(config.include_targets);

    let result = if config.json_format {
        builder.json().try_init()
    } else if config.include_timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };

    result.map_err(|e| e.to_string())
}

impl SphereConfig {
    /// Configuration optimized for development.
    pub fn development() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 2,
                handler_timeout_secs: Some(60),
                health_check_interval_secs: 10,
                ..Default::default()
            },
            queue: QueueConfig {
                capacity: 1000,
                ..Default::default()
            },
            retry: RetryPolicy::default(),
            storage: StorageConfig::memory(),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Configuration optimized for production.
    pub fn production(journal_path: impl Into<String>) -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: num_cpus::get() * 2,
                handler_timeout_secs: Some(300),
                drain_timeout_secs: 60,
                health_check_interval_secs: 60,
                ..Default::default()
            },
            queue: QueueConfig {
                capacity: 0, // unbounded
                ..Default::default()
            },
            retry: RetryPolicy::exponential(5),
            storage: StorageConfig::journal(journal_path),
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                ..Default::default()
            },
        }
    }

    /// Configuration for testing.
    pub fn testing() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 1,
                poll_timeout_ms: 50,
                handler_timeout_secs: Some(10),
                drain_timeout_secs: 5,
                health_check_interval_secs: 1,
            },
            queue: QueueConfig {
                capacity: 100,
                ..Default::default()
            },
            retry: RetryPolicy::fixed(1, 100),
            storage: StorageConfig::memory(),
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers.num_workers == 0 {
            errors.push("Number of workers must be greater than 0".to_string());
        }

        if self.workers.num_workers > 1000 {
            errors.push("Number of workers should not exceed 1000".to_string());
        }

        if self.workers.poll_timeout_ms == 0 {
            errors.push("Worker poll timeout must be greater than 0".to_string());
        }

        if self.retry.max_attempts == 0 {
            errors.push("Retry max attempts must be greater than 0".to_string());
        }

        if self.retry.base_delay_ms == 0 {
            errors.push("Retry base delay must be greater than 0".to_string());
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        if self.retry.multiplier < 1.0 {
            errors.push("Retry multiplier must be at least 1.0".to_string());
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            errors.push("Retry jitter fraction must be within [0, 1]".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
