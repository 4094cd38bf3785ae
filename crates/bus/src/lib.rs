//! Outpost Bus - Message bus adapter for the delivery relay
//!
//! The relay only depends on the [`MessageBus`] and [`SendEndpoint`] traits;
//! [`HttpBus`] is the shipped transport, delivering envelopes to webhook
//! destinations over HTTP.

pub mod http;

pub use http::HttpBus;

use async_trait::async_trait;
use outpost_core::{BusError, MessageId, OutboxId, OutboxMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The outbound message handed to the bus, populated from a stored row.
///
/// The bus adapter owns the on-wire format; the relay never interprets
/// headers or body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub message_id: MessageId,
    pub outbox_id: OutboxId,
    pub sequence_number: i64,
    pub destination_address: String,
    pub headers: serde_json::Value,
    pub body: serde_json::Value,
}

impl OutboxEnvelope {
    /// Build the envelope for a stored message bound for `destination`
    pub fn from_message(outbox_id: OutboxId, message: &OutboxMessage, destination: &str) -> Self {
        Self {
            message_id: message.message_id,
            outbox_id,
            sequence_number: message.sequence_number,
            destination_address: destination.to_string(),
            headers: message.headers.clone(),
            body: message.body.clone(),
        }
    }
}

/// A message bus the relay can publish to
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Suspend until the bus reports healthy or the token is cancelled
    async fn wait_for_healthy(&self, shutdown: &CancellationToken) -> Result<(), BusError>;

    /// Resolve a destination address to a reusable send handle
    fn send_endpoint(&self, address: &str) -> Result<Arc<dyn SendEndpoint>, BusError>;
}

/// A resolved destination
#[async_trait]
pub trait SendEndpoint: Send + Sync {
    /// Emit one envelope, resolving only after the broker acknowledged it
    async fn send(&self, envelope: &OutboxEnvelope) -> Result<(), BusError>;
}
