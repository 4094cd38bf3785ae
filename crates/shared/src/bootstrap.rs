use anyhow::Result;
use outpost_core::CoreConfig;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize dotenvy
pub fn init_env() {
    dotenvy::dotenv().ok();
}

/// Initialize tracing: console output plus a non-blocking JSONL file sink
pub fn init_tracing(service_name: &str) -> tracing_appender::non_blocking::WorkerGuard {
    // If LOG_DIR is set, use it. Default to "logs"
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());

    let started = chrono::Local::now().format("%y-%m-%d-%H-%M-%S");
    let filename = format!("outpost-{service_name}.log.{started}.jsonl");

    let file_appender = tracing_appender::rolling::never(&log_dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = format!("info,{service_name}=debug,sqlx=warn");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    guard
}

/// Initialize database pool
pub async fn init_db(config: &CoreConfig) -> Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800)) // 30 minutes
        .connect(&config.database_url)
        .await?;

    tracing::info!(
        "Database pool established (max_connections: {})",
        config.db_max_connections
    );

    Ok(pool)
}
