//! Lock-token store strategy backed by process memory
//!
//! Models a document store without native row locks: acquiring an outbox
//! atomically marks it held and rotates the state's `lock_token`; a contended
//! acquisition fails immediately instead of blocking. Writes are buffered in
//! the session and applied atomically at commit, with the same
//! `stored.version < new.version` guard the SQL strategy uses.
//!
//! Also the store used by the relay's integration tests.

use async_trait::async_trait;
use outpost_core::{MessageId, OutboxId, OutboxMessage, OutboxState, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::{OutboxStore, StoreSession};

#[derive(Default)]
struct MemoryInner {
    messages: Vec<OutboxMessage>,
    states: HashMap<OutboxId, OutboxState>,
    held_locks: HashSet<OutboxId>,
}

/// In-memory implementation of [`OutboxStore`] using lock tokens
#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a message the way a producer transaction would
    pub fn insert_message(&self, message: OutboxMessage) {
        self.lock_inner().messages.push(message);
    }

    /// Remaining messages for an outbox, ordered by sequence number
    pub fn messages_for(&self, outbox_id: OutboxId) -> Vec<OutboxMessage> {
        let inner = self.lock_inner();
        let mut messages: Vec<OutboxMessage> = inner
            .messages
            .iter()
            .filter(|m| m.outbox_id == Some(outbox_id))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.sequence_number);
        messages
    }

    /// Current state row for an outbox, if any
    pub fn state_for(&self, outbox_id: OutboxId) -> Option<OutboxState> {
        self.lock_inner().states.get(&outbox_id).cloned()
    }

    /// Total number of message rows, including null-outbox rows
    pub fn message_count(&self) -> usize {
        self.lock_inner().messages.len()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    type Session = MemorySession;

    async fn begin(&self) -> Result<MemorySession, StoreError> {
        Ok(MemorySession {
            inner: Arc::clone(&self.inner),
            token: Uuid::new_v4(),
            locked: None,
            ops: Vec::new(),
            finished: false,
        })
    }

    async fn pending_outbox_ids(&self, limit: i64) -> Result<Vec<OutboxId>, StoreError> {
        let inner = self.lock_inner();
        let mut seen = HashSet::new();
        let ids = inner
            .messages
            .iter()
            .filter_map(|m| m.outbox_id)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .filter(|id| seen.insert(*id))
            .collect();
        Ok(ids)
    }

    fn retries_transient_attempts(&self) -> bool {
        // A send may have succeeded before the commit fault
        false
    }
}

enum Op {
    InsertState(OutboxState),
    ReplaceState(OutboxState),
    DeleteMessage(MessageId),
    PurgeOutbox(OutboxId),
}

/// One buffered transaction against the shared map
pub struct MemorySession {
    inner: Arc<Mutex<MemoryInner>>,
    token: Uuid,
    locked: Option<OutboxId>,
    ops: Vec<Op>,
    finished: bool,
}

impl MemorySession {
    fn lock_inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&mut self) {
        if let Some(outbox_id) = self.locked.take() {
            self.lock_inner().held_locks.remove(&outbox_id);
        }
        self.finished = true;
    }

    /// Check every state guard before any op mutates the shared map, so a
    /// rejected commit applies nothing
    fn validate(inner: &MemoryInner, ops: &[Op]) -> Result<(), StoreError> {
        for op in ops {
            match op {
                Op::InsertState(state) => {
                    if inner.states.contains_key(&state.outbox_id) {
                        return Err(StoreError::Conflict(state.outbox_id));
                    }
                }
                Op::ReplaceState(state) => match inner.states.get(&state.outbox_id) {
                    Some(stored) if stored.version < state.version => {}
                    _ => return Err(StoreError::Conflict(state.outbox_id)),
                },
                Op::DeleteMessage(_) | Op::PurgeOutbox(_) => {}
            }
        }
        Ok(())
    }

    fn apply(inner: &mut MemoryInner, op: Op) {
        match op {
            Op::InsertState(state) | Op::ReplaceState(state) => {
                inner.states.insert(state.outbox_id, state);
            }
            Op::DeleteMessage(message_id) => {
                inner.messages.retain(|m| m.message_id != message_id);
            }
            Op::PurgeOutbox(outbox_id) => {
                inner.messages.retain(|m| m.outbox_id != Some(outbox_id));
                inner.states.remove(&outbox_id);
            }
        }
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn lock_state(&mut self, outbox_id: OutboxId) -> Result<Option<OutboxState>, StoreError> {
        let mut inner = self.lock_inner();
        if inner.held_locks.contains(&outbox_id) {
            return Err(StoreError::LockContended(outbox_id));
        }
        inner.held_locks.insert(outbox_id);
        drop(inner);
        self.locked = Some(outbox_id);

        let mut inner = self.lock_inner();
        if let Some(state) = inner.states.get_mut(&outbox_id) {
            // Locate-and-mark: the token rotation identifies this holder
            state.lock_token = Some(self.token);
            Ok(Some(state.clone()))
        } else {
            Ok(None)
        }
    }

    async fn insert_state(&mut self, state: &OutboxState) -> Result<(), StoreError> {
        // The token is set in the same insert
        let mut state = state.clone();
        state.lock_token = Some(self.token);
        self.ops.push(Op::InsertState(state));
        Ok(())
    }

    async fn replace_state(&mut self, state: &OutboxState) -> Result<(), StoreError> {
        self.ops.push(Op::ReplaceState(state.clone()));
        Ok(())
    }

    async fn messages_after(
        &mut self,
        outbox_id: OutboxId,
        sequence_number: i64,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let inner = self.lock_inner();
        let mut messages: Vec<OutboxMessage> = inner
            .messages
            .iter()
            .filter(|m| m.outbox_id == Some(outbox_id) && m.sequence_number > sequence_number)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.sequence_number);
        messages.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(messages)
    }

    async fn delete_message(&mut self, message_id: MessageId) -> Result<(), StoreError> {
        self.ops.push(Op::DeleteMessage(message_id));
        Ok(())
    }

    async fn purge_outbox(&mut self, outbox_id: OutboxId) -> Result<u64, StoreError> {
        let removed = {
            let inner = self.lock_inner();
            inner
                .messages
                .iter()
                .filter(|m| m.outbox_id == Some(outbox_id))
                .count() as u64
        };
        self.ops.push(Op::PurgeOutbox(outbox_id));
        Ok(removed)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let ops = std::mem::take(&mut self.ops);
        let result = {
            let mut inner = self.lock_inner();
            Self::validate(&inner, &ops).map(|()| {
                for op in ops {
                    Self::apply(&mut inner, op);
                }
            })
        };
        self.release();
        result
    }

    async fn abort(mut self) -> Result<(), StoreError> {
        self.ops.clear();
        self.release();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.finished {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(outbox_id: Option<OutboxId>, seq: i64) -> OutboxMessage {
        OutboxMessage {
            message_id: MessageId::new(),
            outbox_id,
            sequence_number: seq,
            destination_address: Some("https://bus.local/test".to_string()),
            headers: json!({}),
            body: json!({"seq": seq}),
        }
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = MemoryOutboxStore::new();
        let outbox_id = OutboxId::new();
        store.insert_message(message(Some(outbox_id), 1));

        let mut first = store.begin().await.unwrap();
        assert!(first.lock_state(outbox_id).await.unwrap().is_none());

        let mut second = store.begin().await.unwrap();
        assert!(matches!(
            second.lock_state(outbox_id).await,
            Err(StoreError::LockContended(_))
        ));

        first.abort().await.unwrap();

        let mut third = store.begin().await.unwrap();
        assert!(third.lock_state(outbox_id).await.unwrap().is_none());
        third.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_token_rotates_per_acquisition() {
        let store = MemoryOutboxStore::new();
        let outbox_id = OutboxId::new();

        let mut session = store.begin().await.unwrap();
        assert!(session.lock_state(outbox_id).await.unwrap().is_none());
        session.insert_state(&OutboxState::new(outbox_id)).await.unwrap();
        session.commit().await.unwrap();

        let first_token = store.state_for(outbox_id).unwrap().lock_token;
        assert!(first_token.is_some());

        let mut session = store.begin().await.unwrap();
        session.lock_state(outbox_id).await.unwrap();
        session.abort().await.unwrap();

        let second_token = store.state_for(outbox_id).unwrap().lock_token;
        assert_ne!(first_token, second_token);
    }

    #[tokio::test]
    async fn test_replace_rejects_stale_version() {
        let store = MemoryOutboxStore::new();
        let outbox_id = OutboxId::new();

        let mut session = store.begin().await.unwrap();
        session.lock_state(outbox_id).await.unwrap();
        session.insert_state(&OutboxState::new(outbox_id)).await.unwrap();
        session.commit().await.unwrap();

        // Same version as stored: the guard rejects the replace
        let mut session = store.begin().await.unwrap();
        session.lock_state(outbox_id).await.unwrap();
        let stale = store.state_for(outbox_id).unwrap();
        session.replace_state(&stale).await.unwrap();
        assert!(matches!(
            session.commit().await,
            Err(StoreError::Conflict(_))
        ));

        let mut session = store.begin().await.unwrap();
        session.lock_state(outbox_id).await.unwrap();
        let mut advanced = store.state_for(outbox_id).unwrap();
        advanced.version += 1;
        advanced.last_sequence_number = Some(3);
        session.replace_state(&advanced).await.unwrap();
        session.commit().await.unwrap();

        let stored = store.state_for(outbox_id).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.last_sequence_number, Some(3));
    }

    #[tokio::test]
    async fn test_purge_removes_messages_and_state() {
        let store = MemoryOutboxStore::new();
        let outbox_id = OutboxId::new();
        let other = OutboxId::new();
        store.insert_message(message(Some(outbox_id), 1));
        store.insert_message(message(Some(outbox_id), 2));
        store.insert_message(message(Some(other), 1));

        let mut session = store.begin().await.unwrap();
        session.lock_state(outbox_id).await.unwrap();
        session.insert_state(&OutboxState::new(outbox_id)).await.unwrap();
        session.commit().await.unwrap();

        let mut session = store.begin().await.unwrap();
        session.lock_state(outbox_id).await.unwrap();
        let removed = session.purge_outbox(outbox_id).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(removed, 2);
        assert!(store.state_for(outbox_id).is_none());
        assert!(store.messages_for(outbox_id).is_empty());
        assert_eq!(store.messages_for(other).len(), 1);
    }

    #[tokio::test]
    async fn test_pending_ids_cap_rows_then_deduplicate() {
        let store = MemoryOutboxStore::new();
        let a = OutboxId::new();
        let b = OutboxId::new();
        store.insert_message(message(Some(a), 1));
        store.insert_message(message(None, 1));
        store.insert_message(message(Some(a), 2));
        store.insert_message(message(Some(b), 1));

        // The cap applies to rows scanned, before deduplication
        assert_eq!(store.pending_outbox_ids(2).await.unwrap(), vec![a]);
        assert_eq!(store.pending_outbox_ids(10).await.unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_messages_after_orders_and_limits() {
        let store = MemoryOutboxStore::new();
        let outbox_id = OutboxId::new();
        store.insert_message(message(Some(outbox_id), 3));
        store.insert_message(message(Some(outbox_id), 1));
        store.insert_message(message(Some(outbox_id), 2));

        let mut session = store.begin().await.unwrap();
        session.lock_state(outbox_id).await.unwrap();
        let messages = session.messages_after(outbox_id, 1, 10).await.unwrap();
        assert_eq!(
            messages.iter().map(|m| m.sequence_number).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let limited = session.messages_after(outbox_id, 0, 2).await.unwrap();
        assert_eq!(
            limited.iter().map(|m| m.sequence_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        session.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_session_releases_lock() {
        let store = MemoryOutboxStore::new();
        let outbox_id = OutboxId::new();

        {
            let mut session = store.begin().await.unwrap();
            session.lock_state(outbox_id).await.unwrap();
        }

        let mut session = store.begin().await.unwrap();
        assert!(session.lock_state(outbox_id).await.unwrap().is_none());
        session.abort().await.unwrap();
    }
}
