//! Outpost Relay - delivery service binary
//!
//! Drains the transactional outbox tables and publishes pending messages to
//! the configured bus.

use anyhow::Result;
use outpost_bus::{HttpBus, MessageBus};
use outpost_shared::bootstrap;
use outpost_store::PgOutboxStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_env();

    let _guard = bootstrap::init_tracing("relay");

    info!("Starting Outpost relay");

    let config = relay::Config::from_env()?;

    let pool = bootstrap::init_db(&config.core).await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Database migrations completed");

    let store = PgOutboxStore::new(pool);
    let bus: Arc<dyn MessageBus> = Arc::new(HttpBus::new(config.core.bus_health_url.clone()));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    relay::run_relay(store, bus, config, Some(shutdown)).await
}
