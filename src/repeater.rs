//! Backoff/retry scheduling and dead-lettering.
//!
//! The repeater owns the failure half of the message state machine:
//! a failed attempt either goes back to `Pending` with an exponential,
//! jittered delay, or - once the attempt budget is spent - to the
//! terminal `Dead` state. Dead messages are only revived through the
//! explicit [`requeue_dead`](Repeater::requeue_dead) operation, which
//! resets the attempt counter.
//!
//! Re-admission timing is driven by one background scheduling actor
//! that sleeps until the queue's earliest eligibility deadline; there
//! is never a timer per pending retry.

use crate::config::{RetryOrdering, RetryPolicy};
use crate::error::{SphereError, SphereResult};
use crate::message::{MessageId, QueueEntry, WorkerOutcome};
use crate::queue::TaskQueue;
use crate::stats::{Stats, names};
use crate::store::{DurableStore, SharedStore};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// Retry scheduler and dead-letter gate.
pub struct Repeater {
    policy: RetryPolicy,
    ordering: RetryOrdering,
    store: SharedStore,
    queue: Arc<TaskQueue>,
    stats: Stats,
    seq: Arc<AtomicU64>,
}

impl Repeater {
    /// Create a repeater over the given store and queue. `seq` is the
    /// crate-wide sequence source shared with the enqueue path.
    pub fn new(
        policy: RetryPolicy,
        ordering: RetryOrdering,
        store: SharedStore,
        queue: Arc<TaskQueue>,
        stats: Stats,
        seq: Arc<AtomicU64>,
    ) -> Self {
        Self {
            policy,
            ordering,
            store,
            queue,
            stats,
            seq,
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Backoff delay for the retry following `attempt`, with jitter.
    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay_for(attempt);
        if self.policy.jitter_fraction == 0.0 {
            return base;
        }
        let j = self.policy.jitter_fraction;
        let factor = 1.0 + rand::rng().random_range(-j..=j);
        base.mul_f64(factor.max(0.0))
    }

    /// Handle a failure outcome: schedule a retry or dead-letter.
    ///
    /// The durable `mark_pending`/`mark_dead` happens before the queue
    /// re-admission; a persistence failure propagates and the message
    /// stays `InFlight` for crash recovery to reclaim.
    pub async fn on_failure(&self, outcome: &WorkerOutcome) -> SphereResult<()> {
        let id = &outcome.message_id;
        let message = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| SphereError::MessageNotFound { id: id.clone() })?;

        if message.attempt < self.policy.max_attempts {
            let delay = self.jittered_delay(message.attempt);
            let eligible_at = SystemTime::now() + delay;
            self.store.mark_pending(id, eligible_at).await?;

            let seq = match self.ordering {
                RetryOrdering::Fresh => self.next_seq(),
                RetryOrdering::PreserveOriginal => message.seq,
            };
            self.queue
                .admit(QueueEntry::readmitted(id.clone(), seq, eligible_at))
                .await;

            self.stats.counter(names::RETRY_SCHEDULED).increment(1);
            tracing::warn!(
                id = %id,
                attempt = message.attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "message failed, retry scheduled"
            );
        } else {
            self.store.mark_dead(id).await?;
            self.stats.counter(names::PROCESSED_DEAD).increment(1);
            tracing::error!(
                id = %id,
                attempts = message.attempt,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "message dead-lettered after exhausting retries"
            );
        }
        Ok(())
    }

    /// Explicitly revive a dead message: attempt reset to 0, state back
    /// to `Pending`, immediately eligible. The only path out of `Dead`.
    pub async fn requeue_dead(&self, id: &MessageId) -> SphereResult<()> {
        let revived = self.store.reset(id).await?;
        self.queue
            .admit(QueueEntry::readmitted(
                id.clone(),
                self.next_seq(),
                revived.next_eligible_at,
            ))
            .await;
        tracing::info!(id = %id, "dead message explicitly requeued");
        Ok(())
    }

    /// Spawn the background scheduling actor.
    ///
    /// A single task moves due entries from the waiting heap into the
    /// ready set, sleeping until the earliest deadline and waking early
    /// when an admission sets a new one. Exits once the queue closes.
    pub fn spawn_scheduler(queue: Arc<TaskQueue>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!("retry scheduler started");
            loop {
                if queue.is_closed() {
                    break;
                }
                match queue.promote_due().await {
                    Some(at) => {
                        let wait = at
                            .duration_since(SystemTime::now())
                            .unwrap_or(Duration::ZERO);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = queue.schedule_changed() => {}
                        }
                    }
                    None => queue.schedule_changed().await,
                }
            }
            tracing::debug!("retry scheduler stopped");
        })
    }
}
