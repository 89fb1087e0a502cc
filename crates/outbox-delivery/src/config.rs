//! Runtime settings for election, scheduling and delivery.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{backoff::BackoffPolicy, client::ClientConfig};

/// Advisory lock id shared by every instance pointing at the same database.
pub const DEFAULT_LOCK_ID: i64 = 42;

/// Maximum messages fetched per executor cycle.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Wake channel name used for `LISTEN`/`NOTIFY`.
pub const DEFAULT_WAKE_CHANNEL: &str = "outbox_wake";

/// Configuration for the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Advisory lock id used for leader election.
    pub lock_id: i64,

    /// How often each instance tries to acquire the lock.
    pub poll_interval: Duration,

    /// Maximum messages fetched per cycle.
    pub batch_size: usize,

    /// Retry delay policy.
    pub backoff: BackoffPolicy,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Dead-letter forwards allowed along one chain.
    pub max_dead_letter_hops: i32,

    /// Minimum delay before the next cycle after a cycle hit a storage error.
    pub cycle_error_delay: Duration,

    /// Pause before the election loop restarts after an error.
    pub restart_delay: Duration,

    /// Wake channel name.
    pub wake_channel: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            lock_id: DEFAULT_LOCK_ID,
            poll_interval: Duration::from_secs(10),
            batch_size: DEFAULT_BATCH_SIZE,
            backoff: BackoffPolicy::default(),
            client_config: ClientConfig::default(),
            max_dead_letter_hops: 3,
            cycle_error_delay: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            wake_channel: DEFAULT_WAKE_CHANNEL.to_string(),
        }
    }
}
