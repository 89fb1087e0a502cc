//! HTTP request handlers.
//!
//! Handlers validate nothing themselves: inputs are passed to
//! [`outbox_delivery::OutboxService`], and its errors become JSON error
//! responses through [`crate::error::ApiError`].

pub mod crons;
pub mod health;
pub mod messages;
pub mod queues;

pub use crons::create_cron;
pub use health::health_check;
pub use messages::{enqueue_messages, get_message};
pub use queues::{create_queue, get_queue, list_queue_messages};
