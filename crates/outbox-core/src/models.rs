//! Domain records and strongly-typed identifiers.
//!
//! A [`Queue`] describes where and how callbacks are delivered, a [`Message`]
//! is one scheduled callback on a queue, and a [`Cron`] is a recurring
//! definition that keeps exactly one pending message alive. The `New*` input
//! types carry the defaults applied at creation time.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

/// Header name to value map attached to queues, messages and crons.
pub type Headers = HashMap<String, String>;

/// Retry limit applied to queues created without an explicit one.
pub const DEFAULT_MAX_RETRIES: i32 = 10;

/// HTTP method applied to queues created without an explicit one.
pub const DEFAULT_METHOD: &str = "POST";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Strongly-typed queue identifier.
    QueueId
}

uuid_id! {
    /// Strongly-typed message identifier.
    ///
    /// Sent to callback targets as `x-outbox-message-id` so receivers can
    /// deduplicate the occasional redelivery.
    MessageId
}

uuid_id! {
    /// Strongly-typed cron identifier.
    CronId
}

/// Delivery target configuration shared by every message on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Queue {
    /// Unique identifier for this queue.
    pub id: QueueId,

    /// Human-readable queue name.
    pub name: String,

    /// Target URL every message on this queue is delivered to.
    pub callback_url: String,

    /// HTTP method used for delivery.
    pub method: String,

    /// Default headers, overridden per message.
    #[sqlx(json)]
    pub headers: Headers,

    /// Failed attempts allowed before a message is exhausted. Always >= 1.
    pub max_retries: i32,

    /// Queue that receives a copy of each exhausted message.
    pub dead_letter_queue_id: Option<QueueId>,

    /// When the queue was created.
    pub created_at: DateTime<Utc>,

    /// When the queue was last modified.
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueue {
    /// Human-readable queue name.
    pub name: String,

    /// Target URL for deliveries.
    pub callback_url: String,

    /// HTTP method, `POST` when omitted.
    #[serde(default = "default_method")]
    pub method: String,

    /// Default headers for every message.
    #[serde(default)]
    pub headers: Headers,

    /// Retry limit, [`DEFAULT_MAX_RETRIES`] when omitted.
    #[serde(default)]
    pub max_retries: Option<i32>,

    /// Optional dead-letter queue.
    #[serde(default)]
    pub dead_letter_queue_id: Option<QueueId>,
}

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

impl NewQueue {
    /// Creates queue input with default method, headers and retry limit.
    pub fn new(name: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callback_url: callback_url.into(),
            method: default_method(),
            headers: Headers::new(),
            max_retries: None,
            dead_letter_queue_id: None,
        }
    }

    /// Materializes the queue record with a fresh identifier.
    pub fn into_queue(self, now: DateTime<Utc>) -> Queue {
        Queue {
            id: QueueId::new(),
            name: self.name,
            callback_url: self.callback_url,
            method: self.method.to_uppercase(),
            headers: self.headers,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            dead_letter_queue_id: self.dead_letter_queue_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derived delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting for its due time or for a retry.
    Pending,
    /// Delivered successfully.
    Delivered,
    /// Retries exhausted; terminal.
    Failed,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One scheduled callback.
///
/// `sent_at` is set both on success and on terminal failure, so a message is
/// pending exactly while `sent_at` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,

    /// Owning queue.
    pub queue_id: QueueId,

    /// Earliest time the next attempt may run.
    pub when: DateTime<Utc>,

    /// Request body, sent verbatim.
    pub body: Option<String>,

    /// Per-message headers, overriding queue headers.
    #[sqlx(json)]
    pub headers: Headers,

    /// Failed attempts so far.
    pub retries: i32,

    /// Terminal failure flag.
    pub failed: bool,

    /// Time of success or terminal failure.
    pub sent_at: Option<DateTime<Utc>>,

    /// Cron that spawned this message.
    pub cron_id: Option<CronId>,

    /// Dead-letter forwards that produced this message.
    pub dead_letter_hops: i32,

    /// When the message was created.
    pub created_at: DateTime<Utc>,

    /// When the message was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Returns the derived delivery state.
    pub fn status(&self) -> MessageStatus {
        if self.failed {
            MessageStatus::Failed
        } else if self.sent_at.is_some() {
            MessageStatus::Delivered
        } else {
            MessageStatus::Pending
        }
    }

    /// Whether the message still awaits delivery.
    pub fn is_pending(&self) -> bool {
        self.sent_at.is_none() && !self.failed
    }
}

/// Input for enqueueing a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Target queue.
    pub queue_id: QueueId,

    /// Due time, now when omitted.
    #[serde(default)]
    pub when: Option<DateTime<Utc>>,

    /// Request body.
    #[serde(default)]
    pub body: Option<String>,

    /// Per-message headers.
    #[serde(default)]
    pub headers: Headers,

    /// Cron back-reference, set only for cron-spawned messages.
    #[serde(skip)]
    pub cron_id: Option<CronId>,

    /// Dead-letter hop count, set only for dead-letter copies.
    #[serde(skip)]
    pub dead_letter_hops: i32,
}

impl NewMessage {
    /// Creates an immediately due message with no body or headers.
    pub fn new(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            when: None,
            body: None,
            headers: Headers::new(),
            cron_id: None,
            dead_letter_hops: 0,
        }
    }

    /// Sets the due time.
    #[must_use]
    pub fn due_at(mut self, when: DateTime<Utc>) -> Self {
        self.when = Some(when);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Materializes the pending message record, defaulting `when` to `now`.
    pub fn into_message(self, now: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(),
            queue_id: self.queue_id,
            when: self.when.unwrap_or(now),
            body: self.body,
            headers: self.headers,
            retries: 0,
            failed: false,
            sent_at: None,
            cron_id: self.cron_id,
            dead_letter_hops: self.dead_letter_hops,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Recurring delivery definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Cron {
    /// Unique identifier for this cron.
    pub id: CronId,

    /// Queue the spawned messages belong to.
    pub queue_id: QueueId,

    /// Cron expression.
    pub schedule: String,

    /// Headers copied onto each spawned message.
    #[sqlx(json)]
    pub headers: Headers,

    /// Body copied onto each spawned message.
    pub body: Option<String>,

    /// When the cron was created.
    pub created_at: DateTime<Utc>,

    /// When the cron was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Cron {
    /// Builds the pending message for the fire time `when`.
    pub fn spawn_message(&self, when: DateTime<Utc>, now: DateTime<Utc>) -> Message {
        NewMessage {
            queue_id: self.queue_id,
            when: Some(when),
            body: self.body.clone(),
            headers: self.headers.clone(),
            cron_id: Some(self.id),
            dead_letter_hops: 0,
        }
        .into_message(now)
    }
}

/// Input for creating a cron.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCron {
    /// Target queue.
    pub queue_id: QueueId,

    /// Cron expression, with or without a seconds field.
    pub schedule: String,

    /// Headers for spawned messages.
    #[serde(default)]
    pub headers: Headers,

    /// Body for spawned messages.
    #[serde(default)]
    pub body: Option<String>,
}

impl NewCron {
    /// Creates cron input with no headers or body.
    pub fn new(queue_id: QueueId, schedule: impl Into<String>) -> Self {
        Self { queue_id, schedule: schedule.into(), headers: Headers::new(), body: None }
    }

    /// Materializes the cron record with a fresh identifier.
    pub fn into_cron(self, now: DateTime<Utc>) -> Cron {
        Cron {
            id: CronId::new(),
            queue_id: self.queue_id,
            schedule: self.schedule.trim().to_string(),
            headers: self.headers,
            body: self.body,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A due message joined with the delivery settings of its queue.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DueMessage {
    /// The message itself.
    #[sqlx(flatten)]
    pub message: Message,

    /// Target URL.
    pub callback_url: String,

    /// HTTP method.
    pub method: String,

    /// Queue default headers.
    #[sqlx(json)]
    pub queue_headers: Headers,

    /// Retry limit of the queue.
    pub max_retries: i32,

    /// Dead-letter queue of the owning queue.
    pub dead_letter_queue_id: Option<QueueId>,
}

impl DueMessage {
    /// Joins a message with its queue.
    pub fn new(message: Message, queue: &Queue) -> Self {
        Self {
            message,
            callback_url: queue.callback_url.clone(),
            method: queue.method.clone(),
            queue_headers: queue.headers.clone(),
            max_retries: queue.max_retries,
            dead_letter_queue_id: queue.dead_letter_queue_id,
        }
    }
}

/// State change applied to a message after one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageUpdate {
    /// Delivered; terminal.
    Sent {
        /// Time of delivery.
        sent_at: DateTime<Utc>,
    },
    /// Failed; try again later.
    Retry {
        /// New retry count.
        retries: i32,
        /// Next attempt time.
        when: DateTime<Utc>,
    },
    /// Retries exhausted; terminal.
    Failed {
        /// Time of the final attempt.
        failed_at: DateTime<Utc>,
    },
}

/// Everything one delivery attempt changes, committed in a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTransition {
    /// Message being advanced.
    pub message_id: MessageId,

    /// Its new state.
    pub update: MessageUpdate,

    /// Messages created alongside: dead-letter copy, cron successor.
    pub inserts: Vec<Message>,
}

impl MessageTransition {
    /// Creates a transition with no follow-up inserts.
    pub fn new(message_id: MessageId, update: MessageUpdate) -> Self {
        Self { message_id, update, inserts: Vec::new() }
    }

    /// Adds a message inserted in the same transaction.
    pub fn insert(&mut self, message: Message) {
        self.inserts.push(message);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn new_message_defaults_when_to_now() {
        let now = Utc::now();
        let message = NewMessage::new(QueueId::new()).into_message(now);

        assert_eq!(message.when, now);
        assert_eq!(message.retries, 0);
        assert_eq!(message.status(), MessageStatus::Pending);
    }

    #[test]
    fn explicit_due_time_is_kept() {
        let now = Utc::now();
        let later = now + Duration::minutes(5);
        let message = NewMessage::new(QueueId::new()).due_at(later).into_message(now);

        assert_eq!(message.when, later);
    }

    #[test]
    fn status_is_derived_from_flags() {
        let now = Utc::now();
        let mut message = NewMessage::new(QueueId::new()).into_message(now);

        message.sent_at = Some(now);
        assert_eq!(message.status(), MessageStatus::Delivered);

        message.failed = true;
        assert_eq!(message.status(), MessageStatus::Failed);
        assert!(!message.is_pending());
    }

    #[test]
    fn new_queue_applies_defaults() {
        let queue = NewQueue::new("orders", "http://localhost/hook").into_queue(Utc::now());

        assert_eq!(queue.method, "POST");
        assert_eq!(queue.max_retries, DEFAULT_MAX_RETRIES);
        assert!(queue.dead_letter_queue_id.is_none());
    }

    #[test]
    fn new_queue_deserializes_with_defaults() {
        let input: NewQueue = serde_json::from_value(serde_json::json!({
            "name": "orders",
            "callback_url": "http://localhost/hook"
        }))
        .unwrap();

        assert_eq!(input.method, "POST");
        assert!(input.max_retries.is_none());
        assert!(input.headers.is_empty());
    }

    #[test]
    fn cron_spawns_message_with_back_reference() {
        let now = Utc::now();
        let mut cron = NewCron::new(QueueId::new(), "*/5 * * * * *");
        cron.body = Some("tick".to_string());
        let cron = cron.into_cron(now);

        let next = now + Duration::seconds(5);
        let message = cron.spawn_message(next, now);

        assert_eq!(message.cron_id, Some(cron.id));
        assert_eq!(message.queue_id, cron.queue_id);
        assert_eq!(message.when, next);
        assert_eq!(message.body.as_deref(), Some("tick"));
    }

    #[test]
    fn ids_display_as_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(QueueId::from(uuid).to_string(), uuid.to_string());
    }
}
