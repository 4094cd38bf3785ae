//! Row-lock store strategy backed by PostgreSQL
//!
//! One sqlx transaction per session. The state row is locked with the query
//! emitted by the configured [`LockStatementProvider`], so concurrent relay
//! instances serialize on the native row lock.

use async_trait::async_trait;
use outpost_core::{MessageId, OutboxId, OutboxMessage, OutboxState, StoreError};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::lock::{IsolationLevel, LockStatementProvider, PostgresLockStatementProvider};
use crate::{OutboxStore, StoreSession};

// serialization_failure and deadlock_detected
const TRANSIENT_SQLSTATES: [&str; 2] = ["40001", "40P01"];
const UNIQUE_VIOLATION: &str = "23505";

/// Configuration for the Postgres store strategy
#[derive(Clone)]
pub struct PgStoreConfig {
    pub isolation: IsolationLevel,
    pub lock_statement_provider: Arc<dyn LockStatementProvider>,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            lock_statement_provider: Arc::new(PostgresLockStatementProvider),
        }
    }
}

/// Postgres implementation of [`OutboxStore`]
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    config: PgStoreConfig,
}

impl PgOutboxStore {
    /// Create a store with the default configuration
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            config: PgStoreConfig::default(),
        }
    }

    /// Create a store with a custom isolation level or lock statement
    pub fn with_config(pool: PgPool, config: PgStoreConfig) -> Self {
        Self { pool, config }
    }
}

/// Map a sqlx error onto the store taxonomy
fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err
        && let Some(code) = db.code()
        && TRANSIENT_SQLSTATES.contains(&code.as_ref())
    {
        return StoreError::Transient(err);
    }
    StoreError::Database(err)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Session = PgSession;

    async fn begin(&self) -> Result<PgSession, StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query(self.config.isolation.set_statement())
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        Ok(PgSession {
            tx,
            lock_statement: self.config.lock_statement_provider.row_lock_statement(),
        })
    }

    async fn pending_outbox_ids(&self, limit: i64) -> Result<Vec<OutboxId>, StoreError> {
        let rows: Vec<OutboxId> = sqlx::query_scalar(
            r#"
            SELECT outbox_id FROM outbox_messages
            WHERE outbox_id IS NOT NULL
            ORDER BY sequence_number
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let mut seen = HashSet::new();
        let ids: Vec<OutboxId> = rows.into_iter().filter(|id| seen.insert(*id)).collect();

        debug!(count = ids.len(), "Scanned pending outboxes");

        Ok(ids)
    }

    fn retries_transient_attempts(&self) -> bool {
        // An aborted row-lock attempt left no observable side effects
        true
    }
}

/// One Postgres transaction scoped to a delivery attempt
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
    lock_statement: String,
}

#[async_trait]
impl StoreSession for PgSession {
    async fn lock_state(&mut self, outbox_id: OutboxId) -> Result<Option<OutboxState>, StoreError> {
        sqlx::query_as::<_, OutboxState>(&self.lock_statement)
            .bind(outbox_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)
    }

    async fn insert_state(&mut self, state: &OutboxState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_states (outbox_id, last_sequence_number, delivered, version, lock_token)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(state.outbox_id)
        .bind(state.last_sequence_number)
        .bind(state.delivered)
        .bind(state.version)
        .bind(state.lock_token)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            // Another instance created the row first
            if is_unique_violation(&e) {
                StoreError::Conflict(state.outbox_id)
            } else {
                classify(e)
            }
        })?;

        Ok(())
    }

    async fn replace_state(&mut self, state: &OutboxState) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_states
            SET last_sequence_number = $2,
                delivered = $3,
                version = $4,
                lock_token = $5
            WHERE outbox_id = $1 AND version < $4
            "#,
        )
        .bind(state.outbox_id)
        .bind(state.last_sequence_number)
        .bind(state.delivered)
        .bind(state.version)
        .bind(state.lock_token)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(state.outbox_id));
        }

        Ok(())
    }

    async fn messages_after(
        &mut self,
        outbox_id: OutboxId,
        sequence_number: i64,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        sqlx::query_as::<_, OutboxMessage>(
            r#"
            SELECT message_id, outbox_id, sequence_number, destination_address, headers, body
            FROM outbox_messages
            WHERE outbox_id = $1 AND sequence_number > $2
            ORDER BY sequence_number
            LIMIT $3
            "#,
        )
        .bind(outbox_id)
        .bind(sequence_number)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(classify)
    }

    async fn delete_message(&mut self, message_id: MessageId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM outbox_messages WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn purge_outbox(&mut self, outbox_id: OutboxId) -> Result<u64, StoreError> {
        let removed = sqlx::query("DELETE FROM outbox_messages WHERE outbox_id = $1")
            .bind(outbox_id)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?
            .rows_affected();

        sqlx::query("DELETE FROM outbox_states WHERE outbox_id = $1")
            .bind(outbox_id)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;

        Ok(removed)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(classify)
    }

    async fn abort(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(classify)
    }
}
