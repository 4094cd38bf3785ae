//! Polling dispatcher
//!
//! The long-running loop: sleep, wait for bus health, scan for outboxes with
//! pending messages, fan out one worker per outbox, wait for all of them,
//! repeat. Retry happens by the next tick, never inside the loop.

use outpost_bus::MessageBus;
use outpost_core::BusError;
use outpost_store::OutboxStore;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::worker::{RelayError, deliver_outbox};

pub(crate) async fn run_dispatcher<S: OutboxStore>(
    store: S,
    bus: Arc<dyn MessageBus>,
    config: Config,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let options = config.delivery_options();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(config.query_delay()) => {}
        }

        match bus.wait_for_healthy(&shutdown).await {
            Ok(()) => {}
            Err(BusError::Cancelled) => break,
            Err(e) => {
                error!(error = %e, "Bus health wait failed");
                continue;
            }
        }

        let outbox_ids = match store.pending_outbox_ids(config.query_message_limit).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to scan for pending outboxes");
                continue;
            }
        };

        if outbox_ids.is_empty() {
            continue;
        }

        debug!(count = outbox_ids.len(), "Dispatching delivery workers");

        let mut workers = JoinSet::new();
        for outbox_id in outbox_ids {
            let store = store.clone();
            let bus = Arc::clone(&bus);
            let options = options.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                let result =
                    deliver_outbox(&store, bus.as_ref(), &options, outbox_id, &shutdown).await;
                (outbox_id, result)
            });
        }

        // The next pass starts only after every worker has settled; one
        // worker's fault never cancels its siblings
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((outbox_id, Err(RelayError::Cancelled))) => {
                    debug!(outbox_id = %outbox_id, "Delivery worker cancelled");
                }
                Ok((outbox_id, Err(e))) => {
                    error!(outbox_id = %outbox_id, error = %e, "Delivery pass faulted");
                }
                Err(e) => {
                    error!(error = %e, "Delivery worker panicked");
                }
            }
        }
    }

    info!("Outbox dispatcher stopped");
    Ok(())
}
