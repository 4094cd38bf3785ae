//! Outpost Core - Domain types for the outbox delivery relay
//!
//! This crate contains the persistent outbox entities, typed identifiers,
//! the error taxonomy shared by the store and bus adapters, and the common
//! environment configuration. No I/O happens here.

pub mod config;
pub mod error;
pub mod models;
pub mod types;

pub use config::CoreConfig;
pub use error::{BusError, StoreError};
pub use models::{OutboxMessage, OutboxState};
pub use types::{MessageId, OutboxId};
