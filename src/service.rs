//! The sphere service: wires the store, queue, repeater and worker
//! pool together and exposes the enqueue API and the
//! start/drain/stop lifecycle.
//!
//! There is no ambient singleton state: the service is constructed
//! once and every component receives its collaborators by handle.

use crate::config::SphereConfig;
use crate::error::{SphereError, SphereResult};
use crate::message::{Message, MessageHandler, MessageId, MessageState, QueueEntry};
use crate::pagger::Pagger;
use crate::processor::{DrainReport, MessageProcessor};
use crate::queue::TaskQueue;
use crate::repeater::Repeater;
use crate::stats::{Stats, StatsSnapshot, names};
use crate::store::{DurableStore, SharedStore, StoreFactory};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The message processing service.
///
/// # Examples
///
/// ```rust,no_run
/// use sphereq::prelude::*;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// struct Printer;
///
/// #[async_trait]
/// impl MessageHandler for Printer {
///     async fn handle(&self, payload: serde_json::Value) -> SphereResult<()> {
///         println!("got {payload}");
///         Ok(())
///     }
/// }
///
/// # async fn example() -> SphereResult<()> {
/// let service = SphereService::new(SphereConfig::default()).await?;
/// service.start(Arc::new(Printer)).await?;
/// let id = service.enqueue(json!({"work": 1})).await?;
/// println!("enqueued {id}");
/// service.drain(None).await?;
/// # Ok(())
/// # }
/// ```
pub struct SphereService {
    config: SphereConfig,
    store: SharedStore,
    queue: Arc<TaskQueue>,
    repeater: Arc<Repeater>,
    processor: MessageProcessor,
    stats: Stats,
    seq: Arc<AtomicU64>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl std::fmt::Debug for SphereService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SphereService")
            .field("config", &self.config)
            .field("is_running", &self.is_running)
            .finish_non_exhaustive()
    }
}

impl SphereService {
    /// Create a service with the store described by the configuration.
    pub async fn new(config: SphereConfig) -> SphereResult<Self> {
        let store = StoreFactory::from_config(&config.storage)?;
        Self::with_store(config, store).await
    }

    /// Create a service over a caller-supplied store.
    pub async fn with_store(config: SphereConfig, store: SharedStore) -> SphereResult<Self> {
        Self::with_stats(config, store, Stats::new()).await
    }

    /// Create a service over a caller-supplied store and meter (use
    /// [`Stats::with_sink`] to attach an external observer).
    pub async fn with_stats(
        config: SphereConfig,
        store: SharedStore,
        stats: Stats,
    ) -> SphereResult<Self> {
        config
            .validate()
            .map_err(|errors| SphereError::config(errors.join("; ")))?;

        // The sequence continues where the stored history left off.
        let seq = Arc::new(AtomicU64::new(store.high_seq().await?));

        let queue = Arc::new(TaskQueue::new(config.queue.capacity, stats.clone()));
        let repeater = Arc::new(Repeater::new(
            config.retry.clone(),
            config.queue.retry_ordering,
            Arc::clone(&store),
            Arc::clone(&queue),
            stats.clone(),
            Arc::clone(&seq),
        ));
        let processor = MessageProcessor::new(
            config.workers.clone(),
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&repeater),
            stats.clone(),
        );

        Ok(Self {
            config,
            store,
            queue,
            repeater,
            processor,
            stats,
            seq,
            scheduler_handle: Mutex::new(None),
            monitor_handle: Mutex::new(None),
            is_running: AtomicBool::new(false),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enqueue a payload for processing. Returns the assigned message
    /// id.
    ///
    /// Capacity is reserved first (blocking or fail-fast per the queue
    /// configuration), then the message is durably appended, then the
    /// queue entry is admitted - so nothing is ever "ready" in memory
    /// without a recoverable record behind it.
    pub async fn enqueue(&self, payload: serde_json::Value) -> SphereResult<MessageId> {
        self.queue
            .acquire_slot(self.config.queue.enqueue_mode)
            .await?;

        let message = Message::new(payload, self.next_seq());
        let id = message.id.clone();
        let entry = QueueEntry::counted(id.clone(), message.seq, message.next_eligible_at);

        if let Err(e) = self.store.append(message).await {
            self.queue.release_slot();
            return Err(e);
        }
        self.queue.admit(entry).await;

        tracing::debug!(id = %id, "message enqueued");
        Ok(id)
    }

    /// Start processing with the given handler: recover prior state,
    /// spawn the scheduling actor, the worker pool and the health
    /// monitor.
    pub async fn start(&self, handler: Arc<dyn MessageHandler>) -> SphereResult<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SphereError::AlreadyRunning);
        }
        if self.queue.is_closed() {
            self.is_running.store(false, Ordering::SeqCst);
            return Err(SphereError::config(
                "service cannot be restarted; create a new instance",
            ));
        }

        if let Err(e) = self.recover().await {
            // Unable to recover prior state: fatal to the service.
            self.is_running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        *self.scheduler_handle.lock().await =
            Some(Repeater::spawn_scheduler(Arc::clone(&self.queue)));
        *self.monitor_handle.lock().await = Some(self.spawn_monitor());

        self.processor
            .start(self.config.workers.num_workers, handler)
            .await?;

        tracing::info!(
            workers = self.config.workers.num_workers,
            "sphere service started"
        );
        Ok(())
    }

    /// Re-admit every non-terminal message from the store. Abandoned
    /// in-flight claims become pending again with their attempt count
    /// preserved and immediate eligibility - at-least-once delivery.
    async fn recover(&self) -> SphereResult<()> {
        let non_terminal = self.store.load_all_non_terminal().await?;
        if non_terminal.is_empty() {
            return Ok(());
        }

        let mut reclaimed = 0usize;
        let mut readmitted = 0usize;
        for message in non_terminal {
            let eligible_at = match message.state {
                MessageState::InFlight => {
                    let now = SystemTime::now();
                    self.store.mark_pending(&message.id, now).await?;
                    reclaimed += 1;
                    now
                }
                MessageState::Pending => {
                    readmitted += 1;
                    message.next_eligible_at
                }
                MessageState::Done | MessageState::Dead => continue,
            };
            self.queue
                .admit(QueueEntry::readmitted(
                    message.id.clone(),
                    message.seq,
                    eligible_at,
                ))
                .await;
        }

        tracing::info!(readmitted, reclaimed, "recovered unfinished messages");
        Ok(())
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let stats = self.stats.clone();
        let interval_secs = self.config.workers.health_check_interval_secs;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                if queue.is_closed() {
                    break;
                }
                let depth = queue.size().await;
                stats.gauge(names::QUEUE_DEPTH).set(depth as i64);
                let snap = stats.snapshot();
                tracing::info!(
                    depth,
                    success = snap.counter(names::PROCESSED_SUCCESS),
                    failure = snap.counter(names::PROCESSED_FAILURE),
                    dead = snap.counter(names::PROCESSED_DEAD),
                    retries = snap.counter(names::RETRY_SCHEDULED),
                    "health check"
                );
            }
        })
    }

    /// Graceful shutdown: in-flight handlers finish, no new dequeues
    /// start, queued-but-unstarted messages stay pending in the store.
    /// `timeout` defaults to the configured drain timeout.
    pub async fn drain(&self, timeout: Option<Duration>) -> SphereResult<DrainReport> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(SphereError::NotRunning);
        }

        let timeout =
            timeout.unwrap_or(Duration::from_secs(self.config.workers.drain_timeout_secs));
        let report = self.processor.drain(timeout).await;
        self.stop_background_tasks().await;
        Ok(report)
    }

    /// Hard stop: workers are aborted, unresolved outcomes stay
    /// `InFlight` and are reclaimed by recovery on the next start.
    pub async fn stop(&self) -> SphereResult<()> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(SphereError::NotRunning);
        }
        self.processor.stop().await;
        self.stop_background_tasks().await;
        tracing::info!("sphere service stopped");
        Ok(())
    }

    async fn stop_background_tasks(&self) {
        if let Some(mut handle) = self.scheduler_handle.lock().await.take() {
            // Exits on its own once the queue closes, but the close
            // notification can slip past a scheduler that parks right
            // after it; abort rather than leak the task.
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Block until Ctrl+C, then drain gracefully.
    pub async fn run_until_shutdown(&self) -> SphereResult<DrainReport> {
        tokio::signal::ctrl_c().await.map_err(|e| {
            SphereError::config(format!("failed to listen for shutdown signal: {e}"))
        })?;
        tracing::info!("shutdown signal received, draining");
        self.drain(None).await
    }

    /// Whether the service is processing.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Fetch a stored message by id.
    pub async fn get_message(&self, id: &MessageId) -> SphereResult<Option<Message>> {
        self.store.get(id).await
    }

    /// Explicitly revive a dead-lettered message (attempt reset to 0).
    pub async fn requeue_dead(&self, id: &MessageId) -> SphereResult<()> {
        self.repeater.requeue_dead(id).await
    }

    /// Read-only pagination over the stored messages.
    pub fn pager(&self, page_size: usize) -> Pagger {
        Pagger::new(Arc::clone(&self.store), page_size)
    }

    /// Snapshot of the service's counters, timers and gauges.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current number of queued entries.
    pub async fn queue_depth(&self) -> usize {
        self.queue.size().await
    }

    /// The configuration used by this service.
    pub fn config(&self) -> &SphereConfig {
        &self.config
    }
}
