//! Builders for queues and messages with test-friendly defaults.

use chrono::{DateTime, Utc};
use outbox_core::{Headers, Message, NewMessage, NewQueue, Queue, QueueId};
use serde_json::Value;

/// Builder for test queues.
#[derive(Debug, Clone)]
pub struct QueueBuilder {
    input: NewQueue,
}

impl QueueBuilder {
    /// Queue delivering to `callback_url` with the default method and a
    /// generous retry limit.
    pub fn new(callback_url: impl Into<String>) -> Self {
        Self { input: NewQueue::new("test-queue", callback_url) }
    }

    /// Sets the queue name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.input.name = name.into();
        self
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.input.method = method.into();
        self
    }

    /// Adds a default header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.input.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the retry limit.
    #[must_use]
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.input.max_retries = Some(max_retries);
        self
    }

    /// Forwards exhausted messages to `queue_id`.
    #[must_use]
    pub fn dead_letter_queue(mut self, queue_id: QueueId) -> Self {
        self.input.dead_letter_queue_id = Some(queue_id);
        self
    }

    /// Input for `OutboxService::create_queue`.
    pub fn input(self) -> NewQueue {
        self.input
    }

    /// Materialized record for direct insertion into storage.
    pub fn build(self, now: DateTime<Utc>) -> Queue {
        self.input.into_queue(now)
    }
}

/// Builder for test messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    input: NewMessage,
}

impl MessageBuilder {
    /// Message on `queue_id`, due immediately, with an empty JSON body.
    pub fn new(queue_id: QueueId) -> Self {
        Self { input: NewMessage::new(queue_id).with_body("{}") }
    }

    /// Sets the due time.
    #[must_use]
    pub fn due_at(mut self, when: DateTime<Utc>) -> Self {
        self.input = self.input.due_at(when);
        self
    }

    /// Sets a raw body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.input = self.input.with_body(body);
        self
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn json_body(self, value: &Value) -> Self {
        self.body(value.to_string())
    }

    /// Removes the body.
    #[must_use]
    pub fn without_body(mut self) -> Self {
        self.input.body = None;
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.input = self.input.with_header(name, value);
        self
    }

    /// Replaces all headers.
    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.input.headers = headers;
        self
    }

    /// Input for `OutboxService::enqueue`.
    pub fn input(self) -> NewMessage {
        self.input
    }

    /// Materialized record for direct insertion into storage.
    pub fn build(self, now: DateTime<Utc>) -> Message {
        self.input.into_message(now)
    }
}
