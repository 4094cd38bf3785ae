//! Shared configuration logic
//!
//! Handles loading of common environment variables.

use anyhow::{Context, Result};
use std::env;

/// Common configuration used across services
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Database connection URL
    pub database_url: String,

    /// Optional bus health probe URL; absent means the bus is assumed healthy
    pub bus_health_url: Option<String>,

    /// Maximum connections for the database pool
    pub db_max_connections: u32,
}

impl CoreConfig {
    /// Load common configuration from environment variables
    ///
    /// This will also initialize dotenv if it hasn't been done yet.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            bus_health_url: env::var("BUS_HEALTH_URL").ok(),
            db_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a valid integer")?,
        })
    }
}
