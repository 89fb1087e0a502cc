//! Outbox HTTP API.
//!
//! A thin axum layer over [`OutboxService`]: create queues, enqueue
//! messages, register crons and inspect state. Any instance can serve the
//! API; writes on a follower are picked up by the leader via the wake
//! channel.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use outbox_core::Clock;
use outbox_delivery::OutboxService;

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The instance's outbox service.
    pub service: Arc<OutboxService>,
    /// Clock used for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates handler state.
    pub fn new(service: Arc<OutboxService>, clock: Arc<dyn Clock>) -> Self {
        Self { service, clock }
    }
}
