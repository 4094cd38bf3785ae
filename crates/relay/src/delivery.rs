//! Delivery pass over a locked outbox
//!
//! One pass sends as many pending messages as the per-attempt limit allows,
//! in ascending sequence order, deleting each row once the bus acknowledges
//! it. A send fault halts the pass so no later message overtakes an earlier
//! pending one.

use chrono::Utc;
use outpost_bus::{MessageBus, OutboxEnvelope};
use outpost_core::{BusError, OutboxState};
use outpost_store::StoreSession;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::worker::RelayError;

/// Limits applied to a single delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    /// Deadline for one attempt's store transaction
    pub query_timeout: Duration,
    /// Messages sent per attempt
    pub message_delivery_limit: usize,
    /// Deadline for a single bus send
    pub message_delivery_timeout: Duration,
}

pub(crate) struct PassOutcome {
    /// Messages the bus acknowledged during this pass
    pub sent: usize,
    /// A send fault stopped the pass early
    pub faulted: bool,
}

/// Send pending messages for the locked outbox and advance its cursor.
///
/// Mutates `state` in place; the caller persists it and commits. Bus faults
/// are absorbed into the outcome so partial progress still commits; store
/// faults and cancellation propagate and abort the attempt.
pub(crate) async fn delivery_pass<S: StoreSession>(
    session: &mut S,
    bus: &dyn MessageBus,
    state: &mut OutboxState,
    options: &DeliveryOptions,
    shutdown: &CancellationToken,
) -> Result<PassOutcome, RelayError> {
    let outbox_id = state.outbox_id;
    let last = state.last_sequence_number.unwrap_or(0);

    // One row of lookahead distinguishes a limit-bounded batch from a
    // drained outbox
    let query_limit = options.message_delivery_limit + 1;
    let messages = session
        .messages_after(outbox_id, last, query_limit as i64)
        .await?;

    let mut sent_sequence = 0i64;
    let mut sent = 0usize;
    let mut processed = 0usize;
    let mut faulted = false;

    for message in &messages {
        if sent >= options.message_delivery_limit {
            break;
        }

        let Some(destination) = message.destination_address.as_deref() else {
            warn!(
                outbox_id = %outbox_id,
                message_id = %message.message_id,
                sequence_number = message.sequence_number,
                "Message has no destination address, skipping"
            );
            processed += 1;
            continue;
        };

        let envelope = OutboxEnvelope::from_message(outbox_id, message, destination);
        match send_one(bus, destination, &envelope, options, shutdown).await {
            Ok(()) => {
                session.delete_message(message.message_id).await?;
                sent_sequence = message.sequence_number;
                sent += 1;
                processed += 1;
                info!(
                    outbox_id = %outbox_id,
                    sequence_number = message.sequence_number,
                    message_id = %message.message_id,
                    "Outbox message sent"
                );
            }
            Err(BusError::Cancelled) => return Err(RelayError::Cancelled),
            Err(e) => {
                warn!(
                    outbox_id = %outbox_id,
                    sequence_number = message.sequence_number,
                    message_id = %message.message_id,
                    error = %e,
                    "Outbox message send failed"
                );
                faulted = true;
                break;
            }
        }
    }

    if sent_sequence > 0 {
        state.last_sequence_number = Some(sent_sequence);
    }

    // Delivered only when the whole batch was consumed and the store held
    // fewer rows than the query limit
    if !faulted && processed == messages.len() && messages.len() < query_limit {
        state.delivered = Some(Utc::now());
        info!(outbox_id = %outbox_id, "Outbox delivered");
    }

    Ok(PassOutcome { sent, faulted })
}

/// One send with a linked deadline: outer cancellation or the per-send
/// timeout, whichever fires first
async fn send_one(
    bus: &dyn MessageBus,
    destination: &str,
    envelope: &OutboxEnvelope,
    options: &DeliveryOptions,
    shutdown: &CancellationToken,
) -> Result<(), BusError> {
    let endpoint = bus.send_endpoint(destination)?;

    tokio::select! {
        () = shutdown.cancelled() => Err(BusError::Cancelled),
        result = tokio::time::timeout(options.message_delivery_timeout, endpoint.send(envelope)) => {
            match result {
                Ok(send_result) => send_result,
                Err(_) => Err(BusError::Timeout(options.message_delivery_timeout)),
            }
        }
    }
}
