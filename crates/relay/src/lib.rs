//! Outpost Relay - Transactional outbox delivery service
//!
//! Polls the outbox tables for pending messages and publishes them to the
//! configured bus, preserving per-outbox ordering and
//! exactly-once-from-outbox semantics under concurrent relay instances.

mod config;
mod delivery;
mod dispatcher;
mod worker;

pub use config::Config;
pub use delivery::DeliveryOptions;
pub use worker::{RelayError, deliver_outbox};

use anyhow::Result;
use outpost_bus::MessageBus;
use outpost_store::OutboxStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the delivery relay service
///
/// This function runs the polling loop until cancelled or an error occurs.
///
/// # Arguments
/// * `store` - Transactional outbox store (row-lock or lock-token strategy)
/// * `bus` - Message bus the drained messages are published to
/// * `config` - Relay configuration
/// * `shutdown` - Optional cancellation token for graceful shutdown
pub async fn run_relay<S: OutboxStore>(
    store: S,
    bus: Arc<dyn MessageBus>,
    config: Config,
    shutdown: Option<CancellationToken>,
) -> Result<()> {
    info!(
        "Starting relay: query_delay={}s, query_message_limit={}, message_delivery_limit={}",
        config.query_delay_secs, config.query_message_limit, config.message_delivery_limit
    );

    dispatcher::run_dispatcher(store, bus, config, shutdown.unwrap_or_default()).await
}
