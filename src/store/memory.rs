//! In-memory durable store.
//!
//! State machine behaviour is identical to the journal backend, but
//! nothing survives the process. Perfect for development and tests.

use super::DurableStore;
use crate::error::{SphereError, SphereResult};
use crate::message::{Message, MessageId, MessageState};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;
use tokio::sync::RwLock;

/// Message table shared by the store backends: id-keyed records plus a
/// seq-ordered index for the pagination read path.
#[derive(Debug, Default)]
pub(super) struct MessageTable {
    messages: HashMap<MessageId, Message>,
    by_seq: BTreeMap<u64, MessageId>,
}

impl MessageTable {
    pub(super) fn insert(&mut self, message: Message) {
        self.by_seq.insert(message.seq, message.id.clone());
        self.messages.insert(message.id.clone(), message);
    }

    /// CAS `Pending -> InFlight`. Returns whether the claim was won.
    pub(super) fn claim(&mut self, id: &MessageId, attempt: u32) -> bool {
        match self.messages.get_mut(id) {
            Some(msg) if msg.state == MessageState::Pending => {
                msg.state = MessageState::InFlight;
                msg.attempt = attempt;
                true
            }
            _ => false,
        }
    }

    /// Apply a state transition. Returns `Ok(false)` when the record is
    /// already in the target terminal state (idempotent no-op).
    pub(super) fn transition(
        &mut self,
        id: &MessageId,
        state: MessageState,
        attempt: Option<u32>,
        next_eligible_at: Option<SystemTime>,
    ) -> SphereResult<bool> {
        let msg = self
            .messages
            .get_mut(id)
            .ok_or_else(|| SphereError::MessageNotFound { id: id.clone() })?;

        if msg.state == state && msg.state == MessageState::Done {
            return Ok(false);
        }

        msg.state = state;
        if let Some(attempt) = attempt {
            msg.attempt = attempt;
        }
        if let Some(at) = next_eligible_at {
            msg.next_eligible_at = at;
        }
        Ok(true)
    }

    pub(super) fn reset(&mut self, id: &MessageId, eligible_at: SystemTime) -> SphereResult<Message> {
        let msg = self
            .messages
            .get_mut(id)
            .ok_or_else(|| SphereError::MessageNotFound { id: id.clone() })?;

        if msg.state != MessageState::Dead {
            return Err(SphereError::config(format!(
                "cannot requeue message '{id}': not dead"
            )));
        }

        msg.state = MessageState::Pending;
        msg.attempt = 0;
        msg.next_eligible_at = eligible_at;
        Ok(msg.clone())
    }

    pub(super) fn get(&self, id: &MessageId) -> Option<Message> {
        self.messages.get(id).cloned()
    }

    pub(super) fn non_terminal(&self) -> Vec<Message> {
        let mut result: Vec<Message> = self
            .messages
            .values()
            .filter(|m| matches!(m.state, MessageState::Pending | MessageState::InFlight))
            .cloned()
            .collect();
        result.sort_by_key(|m| m.seq);
        result
    }

    pub(super) fn scan(&self, after_seq: u64, upto_seq: u64, limit: usize) -> Vec<Message> {
        self.by_seq
            .range(after_seq + 1..=upto_seq)
            .filter_map(|(_, id)| self.messages.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub(super) fn high_seq(&self) -> u64 {
        self.by_seq.keys().next_back().copied().unwrap_or(0)
    }
}

/// In-memory store backend.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    table: RwLock<MessageTable>,
}

impl InMemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn append(&self, message: Message) -> SphereResult<()> {
        let mut table = self.table.write().await;
        tracing::debug!(id = %message.id, seq = message.seq, "appended message");
        table.insert(message);
        Ok(())
    }

    async fn claim_in_flight(&self, id: &MessageId, attempt: u32) -> SphereResult<bool> {
        let mut table = self.table.write().await;
        Ok(table.claim(id, attempt))
    }

    async fn mark_done(&self, id: &MessageId) -> SphereResult<()> {
        let mut table = self.table.write().await;
        table.transition(id, MessageState::Done, None, None)?;
        Ok(())
    }

    async fn mark_pending(&self, id: &MessageId, next_eligible_at: SystemTime) -> SphereResult<()> {
        let mut table = self.table.write().await;
        table.transition(id, MessageState::Pending, None, Some(next_eligible_at))?;
        Ok(())
    }

    async fn mark_dead(&self, id: &MessageId) -> SphereResult<()> {
        let mut table = self.table.write().await;
        table.transition(id, MessageState::Dead, None, None)?;
        Ok(())
    }

    async fn reset(&self, id: &MessageId) -> SphereResult<Message> {
        let mut table = self.table.write().await;
        table.reset(id, SystemTime::now())
    }

    async fn get(&self, id: &MessageId) -> SphereResult<Option<Message>> {
        let table = self.table.read().await;
        Ok(table.get(id))
    }

    async fn load_all_non_terminal(&self) -> SphereResult<Vec<Message>> {
        let table = self.table.read().await;
        Ok(table.non_terminal())
    }

    async fn scan(&self, after_seq: u64, upto_seq: u64, limit: usize) -> SphereResult<Vec<Message>> {
        let table = self.table.read().await;
        Ok(table.scan(after_seq, upto_seq, limit))
    }

    async fn high_seq(&self) -> SphereResult<u64> {
        let table = self.table.read().await;
        Ok(table.high_seq())
    }
}
