//! Message definition and the handler contract.

use crate::error::SphereResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Unique identifier for a message
pub type MessageId = String;

/// Lifecycle state of a message.
///
/// Transitions are monotonic along the state machine
/// `Pending -> InFlight -> {Done | Pending (retry) | Dead}`.
/// Dead is terminal for internal logic; only an explicit external
/// reset revives a dead message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageState {
    /// Waiting to be processed (or waiting out a retry delay)
    Pending,
    /// Claimed by exactly one worker, execution in progress
    InFlight,
    /// Processed successfully
    Done,
    /// Failed permanently (max attempts exhausted)
    Dead,
}

/// A unit of work with payload, identity and lifecycle state.
///
/// The durable store is the single source of truth for `state`;
/// the task queue only holds transient in-memory order over messages
/// already marked pending or retry-eligible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier, assigned at enqueue, immutable
    pub id: MessageId,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Number of execution attempts started so far
    pub attempt: u32,
    /// Enqueue-order sequence number, assigned once, immutable.
    /// Breaks FIFO ties among simultaneously eligible entries and
    /// serves as the pagination cursor's logical time.
    pub seq: u64,
    /// When the message was enqueued
    pub enqueued_at: SystemTime,
    /// Earliest time the message may be dequeued again
    pub next_eligible_at: SystemTime,
    /// Current lifecycle state
    pub state: MessageState,
}

impl Message {
    /// Create a fresh pending message, immediately eligible.
    pub fn new(payload: serde_json::Value, seq: u64) -> Self {
        let now = SystemTime::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            attempt: 0,
            seq,
            enqueued_at: now,
            next_eligible_at: now,
            state: MessageState::Pending,
        }
    }
}

/// An entry in the task queue: a message reference plus the sequence
/// number used for FIFO ordering among eligible entries.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Id of the referenced message
    pub message_id: MessageId,
    /// Ordering sequence. Fresh-competing retries draw a new one;
    /// order-preserving retries reuse the message's original seq.
    pub seq: u64,
    /// When the entry becomes eligible for dequeue
    pub eligible_at: SystemTime,
    /// Whether the entry holds a producer backpressure permit.
    /// Internal re-admissions (retries, recovery) are not counted
    /// against capacity.
    pub counted: bool,
}

impl QueueEntry {
    /// Entry for a fresh producer enqueue, counted against capacity.
    pub fn counted(message_id: MessageId, seq: u64, eligible_at: SystemTime) -> Self {
        Self {
            message_id,
            seq,
            eligible_at,
            counted: true,
        }
    }

    /// Entry for an internal re-admission, exempt from capacity.
    pub fn readmitted(message_id: MessageId, seq: u64, eligible_at: SystemTime) -> Self {
        Self {
            message_id,
            seq,
            eligible_at,
            counted: false,
        }
    }
}

/// Ephemeral result of a single handler invocation.
///
/// Produced by the processor, consumed by the repeater and stats;
/// never persisted as its own record.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// Id of the processed message
    pub message_id: MessageId,
    /// Whether the handler succeeded
    pub success: bool,
    /// Failure cause, if any
    pub error: Option<String>,
    /// How long the handler invocation took
    pub duration: Duration,
}

/// Processing logic supplied by the caller.
///
/// Must be safe to invoke concurrently across distinct messages.
/// A returned error (or a panic, which the processor captures) drives
/// the retry state machine; it is never surfaced to the producer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message payload.
    async fn handle(&self, payload: serde_json::Value) -> SphereResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message_is_pending_and_eligible() {
        let msg = Message::new(json!({"k": "v"}), 7);
        assert_eq!(msg.state, MessageState::Pending);
        assert_eq!(msg.attempt, 0);
        assert_eq!(msg.seq, 7);
        assert!(msg.next_eligible_at <= SystemTime::now());
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_entry_capacity_accounting() {
        let now = SystemTime::now();
        assert!(QueueEntry::counted("a".into(), 1, now).counted);
        assert!(!QueueEntry::readmitted("a".into(), 2, now).counted);
    }
}
