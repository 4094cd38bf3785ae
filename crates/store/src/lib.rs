//! Outpost Store - Transactional store adapter for the delivery relay
//!
//! The relay is polymorphic over two concurrency-control strategies:
//!
//! - **Row lock** ([`PgOutboxStore`]): SQL stores with native pessimistic row
//!   locks. The state row is locked with the query emitted by a
//!   [`LockStatementProvider`] (a `SELECT ... FOR UPDATE` by default).
//! - **Lock token** ([`MemoryOutboxStore`]): document-style stores without row
//!   locks. Acquisition atomically rotates the state's `lock_token`; a
//!   contended acquisition fails instead of blocking.
//!
//! Each relay instance binds to exactly one strategy.

pub mod lock;
pub mod memory;
pub mod postgres;

pub use lock::{IsolationLevel, LockStatementProvider, PostgresLockStatementProvider};
pub use memory::MemoryOutboxStore;
pub use postgres::{PgOutboxStore, PgStoreConfig};

use async_trait::async_trait;
use outpost_core::{MessageId, OutboxId, OutboxMessage, OutboxState, StoreError};

/// A transactional outbox store.
///
/// `begin` opens one session per delivery attempt; sessions are released on
/// every exit path (commit, abort, or drop).
#[async_trait]
pub trait OutboxStore: Clone + Send + Sync + 'static {
    type Session: StoreSession;

    /// Open a new transactional session
    async fn begin(&self) -> Result<Self::Session, StoreError>;

    /// Scan up to `limit` message rows with a non-null outbox id, projected
    /// to their outbox ids and deduplicated in first-seen order
    async fn pending_outbox_ids(&self, limit: i64) -> Result<Vec<OutboxId>, StoreError>;

    /// Whether a delivery attempt may be re-run after a transient fault.
    ///
    /// True for the row-lock strategy, where an aborted attempt left no
    /// observable side effects. False for the lock-token strategy, where a
    /// send may have succeeded before the commit fault.
    fn retries_transient_attempts(&self) -> bool;
}

/// One store transaction scoped to a single delivery attempt.
#[async_trait]
pub trait StoreSession: Send {
    /// Acquire the exclusive per-outbox lock and load the state row.
    ///
    /// Returns `None` when no state exists yet (the lock is still held for
    /// the outbox id, so a subsequent insert is race-free). Fails with
    /// [`StoreError::LockContended`] on the lock-token strategy when another
    /// session holds the row.
    async fn lock_state(&mut self, outbox_id: OutboxId) -> Result<Option<OutboxState>, StoreError>;

    /// Insert a fresh state row for an outbox seen for the first time
    async fn insert_state(&mut self, state: &OutboxState) -> Result<(), StoreError>;

    /// Replace the state row, guarded by `stored.version < state.version`.
    ///
    /// Fails with [`StoreError::Conflict`] when the guard rejects the write.
    async fn replace_state(&mut self, state: &OutboxState) -> Result<(), StoreError>;

    /// Messages for the outbox with a sequence number strictly greater than
    /// `sequence_number`, ordered ascending, at most `limit` rows
    async fn messages_after(
        &mut self,
        outbox_id: OutboxId,
        sequence_number: i64,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Delete a single message row once the bus has acknowledged it
    async fn delete_message(&mut self, message_id: MessageId) -> Result<(), StoreError>;

    /// Delete every message for the outbox and its state row; returns the
    /// number of messages removed
    async fn purge_outbox(&mut self, outbox_id: OutboxId) -> Result<u64, StoreError>;

    /// Commit the transaction
    async fn commit(self) -> Result<(), StoreError>;

    /// Abort the transaction
    async fn abort(self) -> Result<(), StoreError>;
}
