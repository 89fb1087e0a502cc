//! Outbox scheduled webhook delivery service.
//!
//! Main entry point. Loads configuration, prepares the database, joins
//! leader election and serves the HTTP API until a shutdown signal.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use outbox_api::{AppState, Config};
use outbox_core::{
    storage::{schema, Storage},
    Clock, RealClock,
};
use outbox_delivery::{
    OutboxService, PostgresAdvisoryLock, PostgresDeliveryStorage, PostgresWakeChannel,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        lock_id = config.lock_id,
        "Starting outbox"
    );

    let pool = create_database_pool(&config).await?;
    schema::migrate(&pool).await.context("Failed to run database migrations")?;
    info!("Database ready");

    let delivery_config = config.to_delivery_config();
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let service = Arc::new(
        OutboxService::new(
            Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(pool.clone())))),
            Arc::new(PostgresAdvisoryLock::new(pool.clone())),
            Arc::new(PostgresWakeChannel::new(pool.clone(), delivery_config.wake_channel.clone())),
            clock.clone(),
            delivery_config,
        )
        .context("Failed to build outbox service")?,
    );
    service.start().await;

    let addr = config.parse_server_addr()?;
    let served = outbox_api::start_server(
        AppState::new(service.clone(), clock),
        addr,
        config.request_timeout(),
    )
    .await;

    service.stop().await;
    pool.close().await;
    info!("Outbox shutdown complete");

    served.context("HTTP server failed")
}

/// Initializes tracing; `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool, retrying while the database starts.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if attempt < config.database_connect_attempts => {
                warn!(
                    attempt,
                    max_attempts = config.database_connect_attempts,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
