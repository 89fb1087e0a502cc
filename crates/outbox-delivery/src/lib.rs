//! Leader-elected scheduling and webhook delivery for the outbox.
//!
//! Any number of instances may share one database. They compete for a
//! single advisory lock; the holder becomes leader and is the only instance
//! that delivers messages. Followers still accept writes and forward a wake
//! signal to whoever leads.
//!
//! # Architecture
//!
//! 1. **Election** - [`election::LeaderElection`] polls the lock and swaps
//!    the shared [`dispatcher::Dispatcher`] between dormant and active
//! 2. **Scheduling** - [`scheduler::Scheduler`] keeps one timer armed for the
//!    earliest pending message
//! 3. **Execution** - [`executor::Executor`] fetches due messages, delivers
//!    them concurrently and commits each outcome with its follow-up inserts
//! 4. **Wake signals** - [`notify::WakeChannel`] lets any instance nudge the
//!    leader after inserting work
//!
//! Delivery is at least once. A message whose outcome could not be committed
//! is delivered again, so receivers should deduplicate on the
//! `x-outbox-message-id` header.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use outbox_core::{storage::Storage, RealClock};
//! use outbox_delivery::{
//!     DeliveryConfig, OutboxService, PostgresAdvisoryLock, PostgresDeliveryStorage,
//!     PostgresWakeChannel,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> outbox_delivery::Result<()> {
//! let config = DeliveryConfig::default();
//! let service = OutboxService::new(
//!     Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(pool.clone())))),
//!     Arc::new(PostgresAdvisoryLock::new(pool.clone())),
//!     Arc::new(PostgresWakeChannel::new(pool, config.wake_channel.clone())),
//!     Arc::new(RealClock::new()),
//!     config,
//! )?;
//! service.start().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod cron;
pub mod dispatcher;
pub mod election;
pub mod error;
pub mod executor;
pub mod notify;
pub mod scheduler;
pub mod service;
pub mod storage;

pub use backoff::{Backoff, BackoffPolicy};
pub use client::{ClientConfig, DeliveryClient, DeliveryOutcome, DeliveryRequest};
pub use config::{DeliveryConfig, DEFAULT_BATCH_SIZE, DEFAULT_LOCK_ID, DEFAULT_WAKE_CHANNEL};
pub use cron::{next_fire_after, CronSchedule};
pub use dispatcher::Dispatcher;
pub use election::{
    memory::{MemoryLock, MemoryLockRegistry},
    LeaderElection, LockBackend, PostgresAdvisoryLock, Role,
};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use executor::{CycleReport, DeliveryStats, Executor};
pub use notify::{MemoryWakeChannel, PostgresWakeChannel, WakeChannel, WakeSubscription};
pub use service::OutboxService;
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
