//! Integration tests for the Postgres row-lock strategy
//!
//! These run against a live database provisioned by `#[sqlx::test]`; they are
//! ignored by default so the suite passes without PostgreSQL available.
//! Run them with `cargo test -p outpost-store -- --ignored`.

use outpost_core::{MessageId, OutboxId, OutboxMessage, OutboxState, StoreError};
use outpost_store::{OutboxStore, PgOutboxStore, StoreSession};
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

async fn seed_message(
    pool: &PgPool,
    outbox_id: Option<OutboxId>,
    seq: i64,
    destination: Option<&str>,
) -> sqlx::Result<MessageId> {
    let message_id = MessageId::new();
    sqlx::query(
        r#"
        INSERT INTO outbox_messages (message_id, outbox_id, sequence_number, destination_address, headers, body)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(message_id)
    .bind(outbox_id)
    .bind(seq)
    .bind(destination)
    .bind(json!({}))
    .bind(json!({"seq": seq}))
    .execute(pool)
    .await?;
    Ok(message_id)
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database"]
async fn test_state_roundtrip(pool: PgPool) -> sqlx::Result<()> {
    let store = PgOutboxStore::new(pool);
    let outbox_id = OutboxId::new();

    let mut session = store.begin().await.unwrap();
    assert!(session.lock_state(outbox_id).await.unwrap().is_none());

    let mut state = OutboxState::new(outbox_id);
    state.lock_token = Some(Uuid::new_v4());
    session.insert_state(&state).await.unwrap();
    session.commit().await.unwrap();

    let mut session = store.begin().await.unwrap();
    let loaded = session.lock_state(outbox_id).await.unwrap().unwrap();
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.last_sequence_number, None);
    assert!(loaded.delivered.is_none());
    session.abort().await.unwrap();

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database"]
async fn test_replace_rejects_stale_version(pool: PgPool) -> sqlx::Result<()> {
    let store = PgOutboxStore::new(pool);
    let outbox_id = OutboxId::new();

    let mut session = store.begin().await.unwrap();
    session.lock_state(outbox_id).await.unwrap();
    session.insert_state(&OutboxState::new(outbox_id)).await.unwrap();
    session.commit().await.unwrap();

    // Same version as stored: the optimistic guard rejects the write
    let mut session = store.begin().await.unwrap();
    let stale = session.lock_state(outbox_id).await.unwrap().unwrap();
    assert!(matches!(
        session.replace_state(&stale).await,
        Err(StoreError::Conflict(_))
    ));
    session.abort().await.unwrap();

    let mut session = store.begin().await.unwrap();
    let mut advanced = session.lock_state(outbox_id).await.unwrap().unwrap();
    advanced.version += 1;
    advanced.last_sequence_number = Some(5);
    session.replace_state(&advanced).await.unwrap();
    session.commit().await.unwrap();

    let mut session = store.begin().await.unwrap();
    let loaded = session.lock_state(outbox_id).await.unwrap().unwrap();
    assert_eq!(loaded.version, 2);
    assert_eq!(loaded.last_sequence_number, Some(5));
    session.abort().await.unwrap();

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database"]
async fn test_messages_after_orders_and_limits(pool: PgPool) -> sqlx::Result<()> {
    let store = PgOutboxStore::new(pool.clone());
    let outbox_id = OutboxId::new();
    seed_message(&pool, Some(outbox_id), 3, Some("https://bus.local/a")).await?;
    seed_message(&pool, Some(outbox_id), 1, Some("https://bus.local/a")).await?;
    seed_message(&pool, Some(outbox_id), 2, None).await?;

    let mut session = store.begin().await.unwrap();
    let messages: Vec<OutboxMessage> = session.messages_after(outbox_id, 1, 10).await.unwrap();
    assert_eq!(
        messages.iter().map(|m| m.sequence_number).collect::<Vec<_>>(),
        vec![2, 3]
    );
    assert!(messages[0].destination_address.is_none());

    let limited = session.messages_after(outbox_id, 0, 2).await.unwrap();
    assert_eq!(
        limited.iter().map(|m| m.sequence_number).collect::<Vec<_>>(),
        vec![1, 2]
    );
    session.abort().await.unwrap();

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database"]
async fn test_pending_ids_skip_null_outboxes_and_deduplicate(pool: PgPool) -> sqlx::Result<()> {
    let store = PgOutboxStore::new(pool.clone());
    let outbox_a = OutboxId::new();
    let outbox_b = OutboxId::new();
    seed_message(&pool, Some(outbox_a), 1, Some("https://bus.local/a")).await?;
    seed_message(&pool, None, 1, Some("https://bus.local/x")).await?;
    seed_message(&pool, Some(outbox_a), 2, Some("https://bus.local/a")).await?;
    seed_message(&pool, Some(outbox_b), 1, Some("https://bus.local/b")).await?;

    let ids = store.pending_outbox_ids(10).await.unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&outbox_a));
    assert!(ids.contains(&outbox_b));

    // The row cap applies before deduplication
    let capped = store.pending_outbox_ids(2).await.unwrap();
    assert_eq!(capped, vec![outbox_a]);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database"]
async fn test_delete_and_purge(pool: PgPool) -> sqlx::Result<()> {
    let store = PgOutboxStore::new(pool.clone());
    let outbox_id = OutboxId::new();
    let other = OutboxId::new();
    let first = seed_message(&pool, Some(outbox_id), 1, Some("https://bus.local/a")).await?;
    seed_message(&pool, Some(outbox_id), 2, Some("https://bus.local/a")).await?;
    seed_message(&pool, Some(other), 1, Some("https://bus.local/b")).await?;

    let mut session = store.begin().await.unwrap();
    session.lock_state(outbox_id).await.unwrap();
    session.insert_state(&OutboxState::new(outbox_id)).await.unwrap();
    session.delete_message(first).await.unwrap();
    session.commit().await.unwrap();

    let mut session = store.begin().await.unwrap();
    session.lock_state(outbox_id).await.unwrap();
    let removed = session.purge_outbox(outbox_id).await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(removed, 1);

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_messages")
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 1);

    let states: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_states")
        .fetch_one(&pool)
        .await?;
    assert_eq!(states, 0);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL database"]
async fn test_row_lock_blocks_concurrent_session(pool: PgPool) -> sqlx::Result<()> {
    let store = PgOutboxStore::new(pool);
    let outbox_id = OutboxId::new();

    let mut session = store.begin().await.unwrap();
    session.lock_state(outbox_id).await.unwrap();
    session.insert_state(&OutboxState::new(outbox_id)).await.unwrap();
    session.commit().await.unwrap();

    let mut holder = store.begin().await.unwrap();
    holder.lock_state(outbox_id).await.unwrap();

    // The second session blocks on the row lock until the holder releases it
    let mut contender = store.begin().await.unwrap();
    let blocked =
        tokio::time::timeout(Duration::from_millis(200), contender.lock_state(outbox_id)).await;
    assert!(blocked.is_err());
    drop(contender);

    holder.abort().await.unwrap();

    let mut fresh = store.begin().await.unwrap();
    assert!(fresh.lock_state(outbox_id).await.unwrap().is_some());
    fresh.abort().await.unwrap();

    Ok(())
}
