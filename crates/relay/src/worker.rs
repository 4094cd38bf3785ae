//! Per-outbox delivery worker
//!
//! Runs transactional delivery attempts against a single outbox until it is
//! drained and cleaned up, a fault propagates, or the outbox yields to
//! another relay instance.

use outpost_bus::MessageBus;
use outpost_core::{OutboxId, OutboxState, StoreError};
use outpost_store::{OutboxStore, StoreSession};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::delivery::{DeliveryOptions, delivery_pass};

/// Immediate attempt re-runs after a transient fault, on stores whose
/// aborted attempts leave no observable side effects
const TRANSIENT_ATTEMPT_RETRIES: u32 = 3;

/// Faults raised by a delivery worker
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("delivery attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,
}

enum Attempt {
    /// Run another attempt against this outbox
    Continue,
    /// The outbox is drained, deferred, or handed to another instance
    Stop,
}

/// Drive one outbox until it is drained and cleaned up or deferred.
///
/// Returns `Ok(())` when the outbox was fully processed, when it deferred a
/// faulted send to the next polling pass, or when another relay instance
/// holds its lock.
pub async fn deliver_outbox<S: OutboxStore>(
    store: &S,
    bus: &dyn MessageBus,
    options: &DeliveryOptions,
    outbox_id: OutboxId,
    shutdown: &CancellationToken,
) -> Result<(), RelayError> {
    let mut transient_retries = 0u32;

    loop {
        if shutdown.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let outcome = tokio::time::timeout(
            options.query_timeout,
            attempt(store, bus, options, outbox_id, shutdown),
        )
        .await
        .map_err(|_| RelayError::AttemptTimeout(options.query_timeout))?;

        match outcome {
            Ok(Attempt::Continue) => transient_retries = 0,
            Ok(Attempt::Stop) => return Ok(()),
            Err(RelayError::Store(StoreError::LockContended(id))) => {
                debug!(outbox_id = %id, "Outbox locked by another relay instance, yielding");
                return Ok(());
            }
            Err(RelayError::Store(e))
                if matches!(e, StoreError::Transient(_) | StoreError::Conflict(_))
                    && store.retries_transient_attempts()
                    && transient_retries < TRANSIENT_ATTEMPT_RETRIES =>
            {
                transient_retries += 1;
                warn!(
                    outbox_id = %outbox_id,
                    error = %e,
                    retry = transient_retries,
                    "Transient store fault, retrying delivery attempt"
                );
            }
            Err(e) => return Err(e),
        }
    }
}

/// One transactional attempt: lock, act on the state, commit.
///
/// The transaction is aborted best-effort on every error path; a secondary
/// rollback fault never masks the primary one.
async fn attempt<S: OutboxStore>(
    store: &S,
    bus: &dyn MessageBus,
    options: &DeliveryOptions,
    outbox_id: OutboxId,
    shutdown: &CancellationToken,
) -> Result<Attempt, RelayError> {
    let mut session = store.begin().await?;

    match locked_attempt(&mut session, bus, options, outbox_id, shutdown).await {
        Ok(outcome) => {
            session.commit().await?;
            Ok(outcome)
        }
        Err(err) => {
            if let Err(abort_err) = session.abort().await {
                warn!(
                    outbox_id = %outbox_id,
                    error = %abort_err,
                    "Failed to roll back delivery attempt"
                );
            }
            Err(err)
        }
    }
}

async fn locked_attempt<S: StoreSession>(
    session: &mut S,
    bus: &dyn MessageBus,
    options: &DeliveryOptions,
    outbox_id: OutboxId,
    shutdown: &CancellationToken,
) -> Result<Attempt, RelayError> {
    match session.lock_state(outbox_id).await? {
        // First contact: persist the state row so the next attempt delivers
        // against a durable cursor
        None => {
            session.insert_state(&OutboxState::new(outbox_id)).await?;
            Ok(Attempt::Continue)
        }

        // Delivered was committed by an earlier attempt: remove the outbox
        Some(state) if state.delivered.is_some() => {
            let removed = session.purge_outbox(outbox_id).await?;
            debug!(outbox_id = %outbox_id, removed, "Outbox removed");
            Ok(Attempt::Stop)
        }

        Some(mut state) => {
            let outcome = delivery_pass(session, bus, &mut state, options, shutdown).await?;

            state.version += 1;
            session.replace_state(&state).await?;

            // A faulted or stalled pass defers this outbox to the next
            // polling tick instead of spinning on it
            if outcome.faulted || (outcome.sent == 0 && state.delivered.is_none()) {
                Ok(Attempt::Stop)
            } else {
                Ok(Attempt::Continue)
            }
        }
    }
}
