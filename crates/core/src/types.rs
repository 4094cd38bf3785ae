//! Type-safe wrappers for outbox identifiers
//!
//! These newtypes prevent mixing different ID types at compile time.
//! For example, you cannot pass a MessageId where an OutboxId is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Outbox identifier - groups messages that must be delivered in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct OutboxId(pub Uuid);

impl OutboxId {
    /// Create a new outbox ID
    pub fn new() -> Self {
        OutboxId(Uuid::new_v4())
    }
}

impl Default for OutboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OutboxId {
    fn from(id: Uuid) -> Self {
        OutboxId(id)
    }
}

impl From<OutboxId> for Uuid {
    fn from(id: OutboxId) -> Self {
        id.0
    }
}

/// Message identifier - globally unique, primary key for per-message deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new message ID
    pub fn new() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        MessageId(id)
    }
}

impl From<MessageId> for Uuid {
    fn from(id: MessageId) -> Self {
        id.0
    }
}
