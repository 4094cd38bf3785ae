//! Error types for the store and bus adapters

use crate::types::OutboxId;
use std::time::Duration;
use thiserror::Error;

/// Faults raised by the transactional store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("optimistic concurrency conflict for outbox {0}")]
    Conflict(OutboxId),

    #[error("outbox {0} is locked by another relay instance")]
    LockContended(OutboxId),

    #[error("transient store fault: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Faults raised by the message bus
#[derive(Error, Debug)]
pub enum BusError {
    #[error("invalid destination address: {0}")]
    Endpoint(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for bus operations
pub type BusResult<T> = Result<T, BusError>;
