//! Persistent outbox entities
//!
//! These models map to the outbox tables written by producer transactions
//! and drained by the delivery relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{MessageId, OutboxId};

/// A message queued by a producer transaction.
///
/// Rows are immutable: inserted by the producer, read by a delivery worker,
/// deleted once the bus has acknowledged the send. Rows with a null
/// `outbox_id` belong to a different pathway and are never touched by the
/// relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(sqlx::FromRow)]
pub struct OutboxMessage {
    pub message_id: MessageId,
    pub outbox_id: Option<OutboxId>,
    /// Assigned by the producer, monotonically increasing per outbox
    pub sequence_number: i64,
    /// Routable address; a null value marks a malformed row that is skipped
    pub destination_address: Option<String>,
    #[sqlx(json)]
    pub headers: serde_json::Value,
    #[sqlx(json)]
    pub body: serde_json::Value,
}

/// Per-outbox delivery cursor.
///
/// Lazily created on the first delivery attempt, updated inside the worker's
/// transaction, and deleted together with its messages by the cleanup pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[derive(sqlx::FromRow)]
pub struct OutboxState {
    pub outbox_id: OutboxId,
    /// Sequence number of the last message accepted by the bus
    pub last_sequence_number: Option<i64>,
    /// Set when a delivery pass observed no further messages
    pub delivered: Option<DateTime<Utc>>,
    /// Guards optimistic replaces; strictly increases across committed updates
    pub version: i64,
    /// Rotated on every acquisition by stores without native row locks
    pub lock_token: Option<Uuid>,
}

impl OutboxState {
    /// Fresh state for an outbox seen for the first time
    pub fn new(outbox_id: OutboxId) -> Self {
        Self {
            outbox_id,
            last_sequence_number: None,
            delivered: None,
            version: 1,
            lock_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state_starts_at_version_one() {
        let state = OutboxState::new(OutboxId::new());
        assert_eq!(state.version, 1);
        assert!(state.last_sequence_number.is_none());
        assert!(state.delivered.is_none());
        assert!(state.lock_token.is_none());
    }

    #[test]
    fn test_message_roundtrips_through_json() {
        let message = OutboxMessage {
            message_id: MessageId::new(),
            outbox_id: Some(OutboxId::new()),
            sequence_number: 7,
            destination_address: Some("https://bus.local/orders".to_string()),
            headers: serde_json::json!({"correlation_id": "abc"}),
            body: serde_json::json!({"order_id": 42}),
        };

        let json = serde_json::to_string(&message).unwrap();
        let decoded: OutboxMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.message_id, message.message_id);
        assert_eq!(decoded.sequence_number, 7);
    }
}
