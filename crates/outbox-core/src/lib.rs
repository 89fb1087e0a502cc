//! Core domain models and persistence for scheduled webhook delivery.
//!
//! Provides strongly-typed identifiers, the queue/message/cron records, the
//! clock abstraction used for deterministic testing, and the PostgreSQL
//! repositories every other crate builds on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    Cron, CronId, DueMessage, Headers, Message, MessageId, MessageStatus, MessageTransition,
    MessageUpdate, NewCron, NewMessage, NewQueue, Queue, QueueId, DEFAULT_MAX_RETRIES,
    DEFAULT_METHOD,
};
pub use time::{Clock, RealClock, TestClock};
