//! Worker pool pulling from the task queue and invoking the handler.
//!
//! Each worker processes one message at a time, so exactly
//! `num_workers` messages are in flight system-wide. The handler runs
//! inside its own spawned task: a panic surfaces as a join error and
//! becomes a failure outcome instead of killing the worker loop.
//!
//! A store write that cannot be confirmed discards the in-memory
//! outcome and leaves the record `InFlight`; crash recovery reclaims it
//! on the next start rather than guessing a final state.

use crate::config::WorkerConfig;
use crate::error::{SphereError, SphereResult};
use crate::message::{MessageHandler, WorkerOutcome};
use crate::queue::TaskQueue;
use crate::repeater::Repeater;
use crate::stats::{Stats, names};
use crate::store::{DurableStore, SharedStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

/// Result of a drain request. A drain that misses its timeout is
/// reported, never silently truncated.
#[derive(Debug, Clone)]
pub struct DrainReport {
    /// Whether every worker stopped within the timeout
    pub completed: bool,
    /// Workers that stopped cleanly
    pub workers_stopped: usize,
    /// Workers still finishing in-flight work when the timeout expired
    pub workers_remaining: usize,
}

/// The worker pool.
pub struct MessageProcessor {
    config: WorkerConfig,
    queue: Arc<TaskQueue>,
    store: SharedStore,
    repeater: Arc<Repeater>,
    stats: Stats,
    draining: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageProcessor {
    /// Create a processor over the given queue, store and repeater.
    pub fn new(
        config: WorkerConfig,
        queue: Arc<TaskQueue>,
        store: SharedStore,
        repeater: Arc<Repeater>,
        stats: Stats,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            repeater,
            stats,
            draining: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `worker_count` workers running `handler`.
    pub async fn start(
        &self,
        worker_count: usize,
        handler: Arc<dyn MessageHandler>,
    ) -> SphereResult<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Err(SphereError::AlreadyRunning);
        }

        tracing::info!(workers = worker_count, "starting worker pool");
        for worker_id in 0..worker_count {
            let ctx = WorkerContext {
                worker_id,
                queue: Arc::clone(&self.queue),
                store: Arc::clone(&self.store),
                repeater: Arc::clone(&self.repeater),
                stats: self.stats.clone(),
                handler: Arc::clone(&handler),
                draining: Arc::clone(&self.draining),
                poll_timeout: Duration::from_millis(self.config.poll_timeout_ms),
                handler_timeout: self.config.handler_timeout_secs.map(Duration::from_secs),
            };
            handles.push(tokio::spawn(ctx.run()));
        }
        Ok(())
    }

    /// Graceful shutdown: stop dequeuing, let in-flight handlers
    /// finish, wait up to `drain_timeout`.
    pub async fn drain(&self, drain_timeout: Duration) -> DrainReport {
        self.draining.store(true, Ordering::Relaxed);
        self.queue.close();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let total = handles.len();
        tracing::info!(workers = total, timeout = ?drain_timeout, "draining worker pool");

        let deadline = Instant::now() + drain_timeout;
        let mut stopped = 0;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, &mut handle).await {
                Ok(Ok(())) => stopped += 1,
                Ok(Err(e)) => {
                    // Worker task itself failed; its message stays
                    // InFlight and is reclaimed by recovery.
                    tracing::error!("worker task error during drain: {e}");
                    stopped += 1;
                }
                Err(_) => {
                    tracing::warn!("worker still busy when drain timeout expired");
                }
            }
        }

        let report = DrainReport {
            completed: stopped == total,
            workers_stopped: stopped,
            workers_remaining: total - stopped,
        };
        tracing::info!(
            completed = report.completed,
            stopped = report.workers_stopped,
            remaining = report.workers_remaining,
            "drain finished"
        );
        report
    }

    /// Hard stop: abort workers immediately. Unresolved outcomes are
    /// left `InFlight` for recovery on the next start.
    pub async fn stop(&self) {
        self.draining.store(true, Ordering::Relaxed);
        self.queue.close();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        tracing::info!(workers = handles.len(), "hard-stopping worker pool");
        for handle in handles {
            handle.abort();
        }
    }

    /// Whether the pool is currently running.
    pub async fn is_running(&self) -> bool {
        !self.handles.lock().await.is_empty()
    }
}

struct WorkerContext {
    worker_id: usize,
    queue: Arc<TaskQueue>,
    store: SharedStore,
    repeater: Arc<Repeater>,
    stats: Stats,
    handler: Arc<dyn MessageHandler>,
    draining: Arc<AtomicBool>,
    poll_timeout: Duration,
    handler_timeout: Option<Duration>,
}

impl WorkerContext {
    async fn run(self) {
        tracing::debug!(worker = self.worker_id, "worker started");

        loop {
            if self.draining.load(Ordering::Relaxed) || self.queue.is_closed() {
                break;
            }
            let Some(entry) = self.queue.dequeue(self.poll_timeout).await else {
                continue;
            };
            self.process_entry(&entry.message_id).await;
        }

        tracing::debug!(worker = self.worker_id, "worker stopped");
    }

    async fn process_entry(&self, id: &str) {
        let id = id.to_string();
        let message = match self.store.get(&id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::warn!(id = %id, "dequeued entry references unknown message");
                return;
            }
            Err(e) => {
                tracing::error!(id = %id, "store read failed, skipping entry: {e}");
                return;
            }
        };

        // Exclusive claim; attempt increments exactly once per
        // execution start. Losing the claim means another path already
        // owns the message.
        let attempt = message.attempt + 1;
        match self.store.claim_in_flight(&id, attempt).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::trace!(id = %id, "in-flight claim lost, skipping entry");
                return;
            }
            Err(e) => {
                tracing::error!(id = %id, "claim not durable, skipping entry: {e}");
                return;
            }
        }

        tracing::debug!(worker = self.worker_id, id = %id, attempt, "processing message");
        let start = Instant::now();
        let result = self.invoke_isolated(message.payload).await;
        let duration = start.elapsed();
        self.stats.timer(names::HANDLER_DURATION).record(duration);

        let outcome = WorkerOutcome {
            message_id: id.clone(),
            success: result.is_ok(),
            error: result.err(),
            duration,
        };

        if outcome.success {
            match self.store.mark_done(&id).await {
                Ok(()) => {
                    self.stats.counter(names::PROCESSED_SUCCESS).increment(1);
                    tracing::debug!(worker = self.worker_id, id = %id, ?duration, "message done");
                }
                Err(e) => {
                    // Durability unconfirmed: discard the outcome, the
                    // record stays InFlight for recovery.
                    tracing::error!(id = %id, "mark_done failed, outcome discarded: {e}");
                }
            }
        } else {
            self.stats.counter(names::PROCESSED_FAILURE).increment(1);
            if let Err(e) = self.repeater.on_failure(&outcome).await {
                tracing::error!(id = %id, "retry bookkeeping failed, outcome discarded: {e}");
            }
        }
    }

    /// Run the handler in its own task so a panic becomes a failure
    /// outcome. A timed-out invocation is aborted before the failure
    /// is reported, so the retry it triggers can never run while the
    /// original invocation is still inside the handler.
    async fn invoke_isolated(&self, payload: serde_json::Value) -> Result<(), String> {
        let handler = Arc::clone(&self.handler);
        let mut invocation = tokio::spawn(async move { handler.handle(payload).await });

        let joined = match self.handler_timeout {
            Some(limit) => match timeout(limit, &mut invocation).await {
                Ok(joined) => joined,
                Err(_) => {
                    invocation.abort();
                    // Wait out the cancellation so the invocation is
                    // fully gone before the outcome is reported.
                    let _ = invocation.await;
                    tracing::warn!(worker = self.worker_id, ?limit, "handler timed out");
                    return Err(format!("handler timed out after {limit:?}"));
                }
            },
            None => invocation.await,
        };

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(join_error) => Err(format!("handler panicked: {join_error}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryOrdering, RetryPolicy};
    use crate::error::SphereResult;
    use crate::message::{Message, MessageState, QueueEntry};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicU64};

    struct Fixture {
        queue: Arc<TaskQueue>,
        store: SharedStore,
        stats: Stats,
        processor: MessageProcessor,
    }

    fn fixture(policy: RetryPolicy) -> Fixture {
        fixture_with_timeout(policy, 5)
    }

    fn fixture_with_timeout(policy: RetryPolicy, handler_timeout_secs: u64) -> Fixture {
        let stats = Stats::new();
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let queue = Arc::new(TaskQueue::new(0, stats.clone()));
        let repeater = Arc::new(Repeater::new(
            policy,
            RetryOrdering::Fresh,
            Arc::clone(&store),
            Arc::clone(&queue),
            stats.clone(),
            Arc::new(AtomicU64::new(1000)),
        ));
        let config = WorkerConfig {
            num_workers: 1,
            poll_timeout_ms: 20,
            handler_timeout_secs: Some(handler_timeout_secs),
            ..Default::default()
        };
        let processor = MessageProcessor::new(
            config,
            Arc::clone(&queue),
            Arc::clone(&store),
            repeater,
            stats.clone(),
        );
        Fixture {
            queue,
            store,
            stats,
            processor,
        }
    }

    async fn seed(f: &Fixture, seq: u64) -> String {
        let msg = Message::new(json!({"seq": seq}), seq);
        let id = msg.id.clone();
        let eligible_at = msg.next_eligible_at;
        f.store.append(msg).await.unwrap();
        f.queue
            .admit(QueueEntry::counted(id.clone(), seq, eligible_at))
            .await;
        id
    }

    async fn wait_for_state(store: &SharedStore, id: &str, state: MessageState) {
        let id = id.to_string();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(m) = store.get(&id).await.unwrap()
                    && m.state == state
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message did not reach expected state");
    }

    struct OkHandler;

    #[async_trait]
    impl MessageHandler for OkHandler {
        async fn handle(&self, _payload: serde_json::Value) -> SphereResult<()> {
            Ok(())
        }
    }

    struct FailHandler;

    #[async_trait]
    impl MessageHandler for FailHandler {
        async fn handle(&self, _payload: serde_json::Value) -> SphereResult<()> {
            Err(SphereError::handler_msg("nope"))
        }
    }

    struct PanicOnceHandler(AtomicBool);

    #[async_trait]
    impl MessageHandler for PanicOnceHandler {
        async fn handle(&self, payload: serde_json::Value) -> SphereResult<()> {
            if payload["panic"] == json!(true) && !self.0.swap(true, Ordering::Relaxed) {
                panic!("handler exploded");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_successful_message_is_marked_done() {
        let f = fixture(RetryPolicy::default());
        let id = seed(&f, 1).await;

        f.processor.start(1, Arc::new(OkHandler)).await.unwrap();
        wait_for_state(&f.store, &id, MessageState::Done).await;

        let msg = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(msg.attempt, 1);
        assert_eq!(f.stats.snapshot().counter(names::PROCESSED_SUCCESS), 1);

        let report = f.processor.drain(Duration::from_secs(2)).await;
        assert!(report.completed);
    }

    #[tokio::test]
    async fn test_exhausted_failures_dead_letter() {
        let f = fixture(RetryPolicy::fixed(2, 10));
        let id = seed(&f, 1).await;

        f.processor.start(1, Arc::new(FailHandler)).await.unwrap();
        wait_for_state(&f.store, &id, MessageState::Dead).await;

        let msg = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(msg.attempt, 2);
        let snap = f.stats.snapshot();
        assert_eq!(snap.counter(names::PROCESSED_FAILURE), 2);
        assert_eq!(snap.counter(names::RETRY_SCHEDULED), 1);
        assert_eq!(snap.counter(names::PROCESSED_DEAD), 1);

        f.processor.drain(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_worker() {
        let f = fixture(RetryPolicy::fixed(2, 10));
        let panicking = seed(&f, 1).await;
        let healthy = seed(&f, 2).await;

        // First delivery of the flagged message panics; its retry and
        // the healthy message must still be processed by the same
        // single worker.
        let mut flagged = f.store.get(&panicking).await.unwrap().unwrap();
        flagged.payload = json!({"panic": true});
        f.store.append(flagged).await.unwrap();

        f.processor
            .start(1, Arc::new(PanicOnceHandler(AtomicBool::new(false))))
            .await
            .unwrap();

        wait_for_state(&f.store, &healthy, MessageState::Done).await;
        wait_for_state(&f.store, &panicking, MessageState::Done).await;

        let msg = f.store.get(&panicking).await.unwrap().unwrap();
        assert_eq!(msg.attempt, 2);

        f.processor.drain(Duration::from_secs(2)).await;
    }

    /// Drop guard so the active count falls even when the invocation
    /// task is cancelled mid-handler.
    struct ActiveGuard(Arc<AtomicU32>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct SlowFirstHandler {
        active: Arc<AtomicU32>,
        overlapped: Arc<AtomicBool>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for SlowFirstHandler {
        async fn handle(&self, _payload: serde_json::Value) -> SphereResult<()> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let _running = ActiveGuard(Arc::clone(&self.active));
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1500)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_timed_out_invocation_is_cancelled_before_retry() {
        let f = fixture_with_timeout(RetryPolicy::fixed(2, 10), 1);
        let id = seed(&f, 1).await;

        let active = Arc::new(AtomicU32::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(SlowFirstHandler {
            active: Arc::clone(&active),
            overlapped: Arc::clone(&overlapped),
            calls: AtomicU32::new(0),
        });

        // Two workers: without cancellation the retry would execute
        // while the first invocation is still sleeping.
        f.processor.start(2, handler).await.unwrap();
        wait_for_state(&f.store, &id, MessageState::Done).await;

        let msg = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(msg.attempt, 2);
        assert!(!overlapped.load(Ordering::SeqCst));
        assert_eq!(f.stats.snapshot().counter(names::PROCESSED_FAILURE), 1);

        f.processor.drain(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let f = fixture(RetryPolicy::default());
        f.processor.start(1, Arc::new(OkHandler)).await.unwrap();
        let err = f.processor.start(1, Arc::new(OkHandler)).await.unwrap_err();
        assert!(matches!(err, SphereError::AlreadyRunning));
        f.processor.drain(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_drain_leaves_queued_messages_pending() {
        let f = fixture(RetryPolicy::default());
        f.processor.start(1, Arc::new(OkHandler)).await.unwrap();
        let report = f.processor.drain(Duration::from_secs(2)).await;
        assert!(report.completed);

        // Enqueued after the drain: never dequeued, stays pending.
        let msg = Message::new(json!({}), 9);
        let id = msg.id.clone();
        f.store.append(msg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.store.get(&id).await.unwrap().unwrap().state,
            MessageState::Pending
        );
    }

    #[tokio::test]
    async fn test_claim_lost_entry_is_skipped() {
        let f = fixture(RetryPolicy::default());
        let id = seed(&f, 1).await;
        // Another owner already claimed the message.
        f.store.claim_in_flight(&id, 1).await.unwrap();

        f.processor.start(1, Arc::new(OkHandler)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Still in flight with the original attempt: the worker
        // skipped the stale entry instead of double-processing.
        let msg = f.store.get(&id).await.unwrap().unwrap();
        assert_eq!(msg.state, MessageState::InFlight);
        assert_eq!(msg.attempt, 1);
        assert_eq!(f.stats.snapshot().counter(names::PROCESSED_SUCCESS), 0);

        f.processor.drain(Duration::from_secs(2)).await;
    }
}
