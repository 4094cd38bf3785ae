//! Configuration for the relay process
//!
//! Loads configuration from environment variables

use anyhow::{Context, Result, ensure};
use outpost_core::CoreConfig;
use std::env;
use std::time::Duration;

use crate::delivery::DeliveryOptions;

/// Relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration (database, bus health probe)
    pub core: CoreConfig,

    /// Sleep between polling passes, in seconds
    pub query_delay_secs: u64,

    /// Deadline for one delivery attempt's store transaction, in seconds
    pub query_timeout_secs: u64,

    /// Message rows scanned per pass when discovering pending outboxes
    pub query_message_limit: i64,

    /// Messages sent per attempt per outbox
    pub message_delivery_limit: usize,

    /// Deadline for a single bus send, in seconds
    pub message_delivery_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Self {
            core: CoreConfig::from_env()?,

            query_delay_secs: env::var("RELAY_QUERY_DELAY_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("RELAY_QUERY_DELAY_SECS must be a valid integer")?,

            query_timeout_secs: env::var("RELAY_QUERY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("RELAY_QUERY_TIMEOUT_SECS must be a valid integer")?,

            query_message_limit: env::var("RELAY_QUERY_MESSAGE_LIMIT")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("RELAY_QUERY_MESSAGE_LIMIT must be a valid integer")?,

            message_delivery_limit: env::var("RELAY_MESSAGE_DELIVERY_LIMIT")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("RELAY_MESSAGE_DELIVERY_LIMIT must be a valid integer")?,

            message_delivery_timeout_secs: env::var("RELAY_MESSAGE_DELIVERY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("RELAY_MESSAGE_DELIVERY_TIMEOUT_SECS must be a valid integer")?,
        };

        ensure!(
            config.query_message_limit > 0,
            "RELAY_QUERY_MESSAGE_LIMIT must be positive"
        );
        ensure!(
            config.message_delivery_limit > 0,
            "RELAY_MESSAGE_DELIVERY_LIMIT must be positive"
        );

        Ok(config)
    }

    pub fn query_delay(&self) -> Duration {
        Duration::from_secs(self.query_delay_secs)
    }

    /// Per-attempt limits handed to the delivery workers
    pub fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            message_delivery_limit: self.message_delivery_limit,
            message_delivery_timeout: Duration::from_secs(self.message_delivery_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_structure() {
        let config = Config {
            core: CoreConfig {
                database_url: "postgres://localhost".to_string(),
                bus_health_url: None,
                db_max_connections: 10,
            },
            query_delay_secs: 10,
            query_timeout_secs: 30,
            query_message_limit: 100,
            message_delivery_limit: 100,
            message_delivery_timeout_secs: 30,
        };

        assert_eq!(config.query_delay(), Duration::from_secs(10));

        let options = config.delivery_options();
        assert_eq!(options.message_delivery_limit, 100);
        assert_eq!(options.query_timeout, Duration::from_secs(30));
    }
}
