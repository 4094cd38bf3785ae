//! HTTP webhook bus
//!
//! Destination addresses are URLs; an envelope is delivered by POSTing it as
//! JSON and treating any 2xx status as broker acknowledgement. Health is an
//! optional probe URL polled until it answers 200.

use async_trait::async_trait;
use outpost_core::BusError;
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{MessageBus, OutboxEnvelope, SendEndpoint};

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// HTTP implementation of [`MessageBus`]
#[derive(Clone)]
pub struct HttpBus {
    client: Client,
    health_url: Option<String>,
}

impl HttpBus {
    /// Create a bus; without a health URL the bus is assumed healthy
    pub fn new(health_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            health_url,
        }
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn wait_for_healthy(&self, shutdown: &CancellationToken) -> Result<(), BusError> {
        let Some(url) = &self.health_url else {
            return Ok(());
        };

        loop {
            if shutdown.is_cancelled() {
                return Err(BusError::Cancelled);
            }

            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    debug!(status = %response.status(), "Bus health probe not ready");
                }
                Err(e) => {
                    debug!(error = %e, "Bus health probe failed");
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => return Err(BusError::Cancelled),
                () = tokio::time::sleep(HEALTH_PROBE_INTERVAL) => {}
            }
        }
    }

    fn send_endpoint(&self, address: &str) -> Result<Arc<dyn SendEndpoint>, BusError> {
        let url = Url::parse(address)
            .map_err(|e| BusError::Endpoint(format!("{address}: {e}")))?;

        Ok(Arc::new(HttpSendEndpoint {
            client: self.client.clone(),
            url,
        }))
    }
}

struct HttpSendEndpoint {
    client: Client,
    url: Url,
}

#[async_trait]
impl SendEndpoint for HttpSendEndpoint {
    async fn send(&self, envelope: &OutboxEnvelope) -> Result<(), BusError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(envelope)
            .send()
            .await
            .map_err(|e| BusError::Send(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BusError::Send(format!(
                "destination returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}
