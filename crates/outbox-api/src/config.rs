//! Configuration management for the outbox service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use outbox_delivery::{
    BackoffPolicy, ClientConfig, DeliveryConfig, DEFAULT_BATCH_SIZE, DEFAULT_LOCK_ID,
    DEFAULT_WAKE_CHANNEL,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "outbox.toml";

/// Prefix for environment overrides, e.g. `OUTBOX_PORT`.
const ENV_PREFIX: &str = "OUTBOX_";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority): `DATABASE_URL`, `RUST_LOG`
///    and every key prefixed with `OUTBOX_`, e.g. `OUTBOX_LOCK_ID`
/// 2. Configuration file (`outbox.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    pub database_max_connections: u32,
    /// Connection attempts at startup before giving up.
    pub database_connect_attempts: u32,

    // Server
    /// Server bind address.
    pub host: String,
    /// Server bind port.
    pub port: u16,
    /// HTTP request timeout in seconds.
    pub request_timeout: u64,

    // Election and scheduling
    /// Advisory lock id shared by all instances.
    ///
    /// Environment variable: `OUTBOX_LOCK_ID`
    pub lock_id: i64,
    /// Leadership poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum messages per delivery cycle.
    pub batch_size: usize,
    /// Pause after a cycle hit a storage error, in milliseconds.
    pub cycle_error_delay_ms: u64,
    /// `LISTEN`/`NOTIFY` channel for wake signals.
    pub wake_channel: String,

    // Delivery
    /// Base delay for exponential backoff in milliseconds.
    pub backoff_base_ms: u64,
    /// HTTP request timeout for callbacks in seconds.
    pub delivery_timeout_seconds: u64,
    /// Dead-letter forwards allowed along one chain.
    pub max_dead_letter_hops: i32,

    // Logging
    /// Log filter.
    ///
    /// Environment variable: `RUST_LOG`
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `outbox.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Self::figment()
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::raw().only(&["DATABASE_URL", "RUST_LOG"]))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    /// Figment seeded with the built-in defaults.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    /// Extracts and validates a configuration from `figment`.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to the delivery engine's configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            lock_id: self.lock_id,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            backoff: BackoffPolicy::new(Duration::from_millis(self.backoff_base_ms)),
            client_config: ClientConfig {
                timeout: Duration::from_secs(self.delivery_timeout_seconds),
                ..ClientConfig::default()
            },
            max_dead_letter_hops: self.max_dead_letter_hops,
            cycle_error_delay: Duration::from_millis(self.cycle_error_delay_ms),
            wake_channel: self.wake_channel.clone(),
            ..DeliveryConfig::default()
        }
    }

    /// Parses the server socket address from host and port.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                // Scheme separator, not a password: `postgres://user@host`.
                if self.database_url[colon_pos + 1..].starts_with("//") {
                    return self.database_url.clone();
                }
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        // One connection holds the leadership lock and one listens for wakes.
        if self.database_max_connections < 3 {
            anyhow::bail!("database_max_connections must be at least 3");
        }

        if self.database_connect_attempts == 0 {
            anyhow::bail!("database_connect_attempts must be greater than 0");
        }

        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }

        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }

        if self.max_dead_letter_hops < 0 {
            anyhow::bail!("max_dead_letter_hops cannot be negative");
        }

        if self.wake_channel.trim().is_empty() {
            anyhow::bail!("wake_channel cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let delivery = DeliveryConfig::default();
        Self {
            database_url: "postgresql://localhost/outbox".to_string(),
            database_max_connections: 10,
            database_connect_attempts: 5,
            host: "0.0.0.0".to_string(),
            port: 3000,
            request_timeout: 30,
            lock_id: DEFAULT_LOCK_ID,
            poll_interval_ms: 10_000,
            batch_size: DEFAULT_BATCH_SIZE,
            cycle_error_delay_ms: 5_000,
            wake_channel: DEFAULT_WAKE_CHANNEL.to_string(),
            backoff_base_ms: 100,
            delivery_timeout_seconds: delivery.client_config.timeout.as_secs(),
            max_dead_letter_hops: delivery.max_dead_letter_hops,
            rust_log: "info,outbox=debug".to_string(),
        }
    }
}
