//! Bounded, time-ordered holding area for ready-to-run work.
//!
//! The queue holds only transient in-memory order over messages the
//! store already records as pending. Entries live in one of two
//! structures behind a single mutex:
//!
//! - a seq-ordered ready set, FIFO among simultaneously eligible
//!   entries (retries compete fairly with fresh work),
//! - a min-heap of not-yet-eligible entries keyed by eligibility time,
//!   so dequeue latency never scales with the number of waiting
//!   retries.
//!
//! Producer backpressure is a semaphore of `capacity` permits; a permit
//! is released when a counted entry is dequeued. Internal re-admissions
//! (retries, recovery) bypass the semaphore so they can never be
//! dropped by a full queue.

use crate::config::EnqueueMode;
use crate::error::{SphereError, SphereResult};
use crate::message::QueueEntry;
use crate::stats::{Stats, names};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;

struct WaitingEntry(QueueEntry);

impl PartialEq for WaitingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.eligible_at == other.0.eligible_at && self.0.seq == other.0.seq
    }
}

impl Eq for WaitingEntry {}

impl PartialOrd for WaitingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WaitingEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .eligible_at
            .cmp(&other.0.eligible_at)
            .then(self.0.seq.cmp(&other.0.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    /// Eligible entries, ordered by seq
    ready: BTreeMap<u64, QueueEntry>,
    /// Not-yet-eligible entries, earliest eligibility first
    waiting: BinaryHeap<Reverse<WaitingEntry>>,
}

impl QueueInner {
    /// Insert into the ready set. An entry already queued under the
    /// same seq collapses into one, and a held backpressure permit is
    /// kept so it is still released on dequeue (recovery may re-admit
    /// a message that a pre-start enqueue already counted).
    fn insert_ready(&mut self, mut entry: QueueEntry) {
        if let Some(existing) = self.ready.get(&entry.seq) {
            entry.counted = entry.counted || existing.counted;
        }
        self.ready.insert(entry.seq, entry);
    }

    /// Move entries whose eligibility time has passed into the ready
    /// set. Returns the eligibility time of the earliest entry still
    /// waiting, if any.
    fn promote_due(&mut self, now: SystemTime) -> (usize, Option<SystemTime>) {
        let mut promoted = 0;
        while let Some(Reverse(head)) = self.waiting.peek() {
            if head.0.eligible_at > now {
                break;
            }
            let Some(Reverse(WaitingEntry(entry))) = self.waiting.pop() else {
                break;
            };
            self.insert_ready(entry);
            promoted += 1;
        }
        let next = self.waiting.peek().map(|Reverse(e)| e.0.eligible_at);
        (promoted, next)
    }

    fn len(&self) -> usize {
        self.ready.len() + self.waiting.len()
    }
}

/// The task queue.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    /// Wakes dequeue waiters when an entry becomes ready
    ready_notify: Notify,
    /// Wakes the scheduling actor when an earlier deadline is admitted
    schedule_notify: Notify,
    /// Producer backpressure permits; None when unbounded
    permits: Option<Arc<Semaphore>>,
    capacity: usize,
    closed: AtomicBool,
    stats: Stats,
}

impl TaskQueue {
    /// Create a queue with the given capacity (0 = unbounded).
    pub fn new(capacity: usize, stats: Stats) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            ready_notify: Notify::new(),
            schedule_notify: Notify::new(),
            permits: (capacity > 0).then(|| Arc::new(Semaphore::new(capacity))),
            capacity,
            closed: AtomicBool::new(false),
            stats,
        }
    }

    /// Reserve producer capacity for one entry.
    ///
    /// Must be called (and succeed) before the message is durably
    /// appended; the reservation is consumed by the following
    /// [`admit`](Self::admit) of a counted entry.
    pub async fn acquire_slot(&self, mode: EnqueueMode) -> SphereResult<()> {
        let Some(permits) = &self.permits else {
            return Ok(());
        };
        match mode {
            EnqueueMode::Blocking => permits
                .acquire()
                .await
                .map_err(|_| SphereError::NotRunning)?
                .forget(),
            EnqueueMode::FailFast => match permits.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(tokio::sync::TryAcquireError::NoPermits) => {
                    return Err(SphereError::QueueFull {
                        capacity: self.capacity,
                    });
                }
                Err(tokio::sync::TryAcquireError::Closed) => {
                    return Err(SphereError::NotRunning);
                }
            },
        }
        Ok(())
    }

    /// Give back a reservation that will not be used (the durable
    /// append behind it failed).
    pub(crate) fn release_slot(&self) {
        if let Some(permits) = &self.permits {
            permits.add_permits(1);
        }
    }

    /// Admit an entry. Eligible entries land in the ready set and wake
    /// one dequeuer; future-dated entries wait in the heap and poke the
    /// scheduling actor when they set a new earliest deadline.
    pub async fn admit(&self, entry: QueueEntry) {
        let now = SystemTime::now();
        let depth = {
            let mut inner = self.inner.lock().await;
            if entry.eligible_at <= now {
                tracing::trace!(id = %entry.message_id, seq = entry.seq, "entry ready");
                inner.insert_ready(entry);
                self.ready_notify.notify_one();
            } else {
                let earliest = inner.waiting.peek().map(|Reverse(e)| e.0.eligible_at);
                let new_earliest = earliest.is_none_or(|at| entry.eligible_at < at);
                tracing::trace!(
                    id = %entry.message_id,
                    seq = entry.seq,
                    "entry waiting for eligibility"
                );
                inner.waiting.push(Reverse(WaitingEntry(entry)));
                if new_earliest {
                    self.schedule_notify.notify_one();
                }
            }
            inner.len()
        };
        self.stats.gauge(names::QUEUE_DEPTH).set(depth as i64);
    }

    /// Take the next eligible entry, FIFO by seq, waiting up to
    /// `timeout`. Returns `None` on timeout or once the queue is
    /// closed.
    pub async fn dequeue(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return None;
            }

            let next_eligible = {
                let mut inner = self.inner.lock().await;
                // Opportunistic promotion keeps dequeue correct even
                // between scheduling actor ticks.
                let (_, next) = inner.promote_due(SystemTime::now());
                if let Some((_, entry)) = inner.ready.pop_first() {
                    let depth = inner.len();
                    drop(inner);
                    if entry.counted
                        && let Some(permits) = &self.permits
                    {
                        permits.add_permits(1);
                    }
                    self.stats.gauge(names::QUEUE_DEPTH).set(depth as i64);
                    return Some(entry);
                }
                next
            };

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let mut wait = deadline - now;
            if let Some(at) = next_eligible {
                let until = at
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO);
                wait = wait.min(until);
            }

            tokio::select! {
                _ = self.ready_notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Promote due entries and report the earliest remaining deadline.
    /// Driven by the repeater's scheduling actor.
    pub(crate) async fn promote_due(&self) -> Option<SystemTime> {
        let mut inner = self.inner.lock().await;
        let (promoted, next) = inner.promote_due(SystemTime::now());
        for _ in 0..promoted {
            self.ready_notify.notify_one();
        }
        next
    }

    /// Wait until an admission sets a new earliest deadline.
    pub(crate) async fn schedule_changed(&self) {
        self.schedule_notify.notified().await;
    }

    /// Number of entries held (ready + waiting).
    pub async fn size(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Number of entries eligible for dequeue right now.
    pub async fn peek_ready_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.promote_due(SystemTime::now());
        inner.ready.len()
    }

    /// Stop serving dequeues and wake every waiter. Blocked producers
    /// are released with an error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(permits) = &self.permits {
            permits.close();
        }
        self.ready_notify.notify_waiters();
        self.schedule_notify.notify_waiters();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}
