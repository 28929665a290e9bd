//! Durable message stores.
//!
//! The store is the single source of truth for message state. Every
//! state transition is durable before the corresponding queue admission
//! or removal is considered committed, so a restart can always rebuild
//! the set of unfinished work.
//!
//! Two backends are provided:
//! - **In-memory**: state survives only for the process lifetime;
//!   intended for development and tests.
//! - **Journal**: append-only JSONL file replayed on startup; survives
//!   restarts and crashes.

use crate::config::{StorageBackend, StorageConfig};
use crate::error::SphereResult;
use crate::message::{Message, MessageId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;

pub mod journal;
pub mod memory;

pub use journal::JournalStore;
pub use memory::InMemoryStore;

/// Trait that all durable store backends must implement.
///
/// Messages are mutated through explicit state transitions; the
/// `claim_in_flight` transition has compare-and-set semantics so that
/// no two workers can hold the in-flight claim on the same message.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Durably record a new message. The message arrives in the
    /// `Pending` state with its seq already assigned.
    async fn append(&self, message: Message) -> SphereResult<()>;

    /// Claim the message for execution: `Pending -> InFlight`, with the
    /// attempt counter set to `attempt`.
    ///
    /// Returns `Ok(false)` when the claim is lost (the message is not
    /// in `Pending` state or does not exist) - the caller must skip the
    /// entry instead of processing it.
    async fn claim_in_flight(&self, id: &MessageId, attempt: u32) -> SphereResult<bool>;

    /// Record successful processing: `InFlight -> Done`. Idempotent:
    /// marking an already-done message again is a no-op.
    async fn mark_done(&self, id: &MessageId) -> SphereResult<()>;

    /// Schedule a retry: `InFlight -> Pending`, eligible again at
    /// `next_eligible_at`.
    async fn mark_pending(&self, id: &MessageId, next_eligible_at: SystemTime) -> SphereResult<()>;

    /// Dead-letter the message: `InFlight -> Dead`. Terminal for
    /// internal logic.
    async fn mark_dead(&self, id: &MessageId) -> SphereResult<()>;

    /// Explicit external revival of a dead message: `Dead -> Pending`
    /// with the attempt counter reset to 0 and immediate eligibility.
    /// Returns the updated message.
    async fn reset(&self, id: &MessageId) -> SphereResult<Message>;

    /// Fetch a message by id.
    async fn get(&self, id: &MessageId) -> SphereResult<Option<Message>>;

    /// All messages whose last recorded state is `Pending` or
    /// `InFlight`. Used once at startup for crash recovery.
    async fn load_all_non_terminal(&self) -> SphereResult<Vec<Message>>;

    /// Messages with `after_seq < seq <= upto_seq`, in seq order, at
    /// most `limit` of them. Read path for pagination.
    async fn scan(&self, after_seq: u64, upto_seq: u64, limit: usize) -> SphereResult<Vec<Message>>;

    /// Highest seq ever appended (0 when the store is empty). Pins the
    /// snapshot boundary for a pagination cursor.
    async fn high_seq(&self) -> SphereResult<u64>;
}

/// Convenient type alias for a shared store handle.
pub type SharedStore = Arc<dyn DurableStore>;

/// Factory for creating store backends from configuration.
pub struct StoreFactory;

impl StoreFactory {
    /// Build the store described by `config`.
    ///
    /// An unreadable journal is fatal: prior state cannot be recovered,
    /// so the error propagates instead of silently starting empty.
    pub fn from_config(config: &StorageConfig) -> SphereResult<SharedStore> {
        match &config.backend {
            StorageBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
            StorageBackend::Journal { path } => Ok(Arc::new(JournalStore::open(path)?)),
        }
    }
}
