//! Instance-level facade: validation, persistence hooks and lifecycle.
//!
//! Every instance runs an [`OutboxService`]. Writes are accepted on any
//! instance; after a write the service arms its own dispatcher (a no-op on
//! followers) and publishes a wake signal so the leader, wherever it runs,
//! re-checks due work.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use outbox_core::{
    models::{Cron, Message, MessageId, NewCron, NewMessage, NewQueue, Queue, QueueId},
    Clock,
};
use reqwest::Method;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    client::DeliveryClient,
    config::DeliveryConfig,
    cron::CronSchedule,
    dispatcher::Dispatcher,
    election::{LeaderElection, LockBackend, Role},
    error::{DeliveryError, Result},
    executor::{DeliveryStats, Executor},
    notify::WakeChannel,
    storage::DeliveryStorage,
};

/// Upper bound on messages returned by [`OutboxService::messages_for_queue`].
pub const MAX_LISTED_MESSAGES: usize = 1000;

/// The outbox as seen by one instance.
pub struct OutboxService {
    storage: Arc<dyn DeliveryStorage>,
    wake: Arc<dyn WakeChannel>,
    clock: Arc<dyn Clock>,
    executor: Executor,
    dispatcher: Arc<RwLock<Dispatcher>>,
    election: LeaderElection,
}

impl OutboxService {
    /// Builds a follower instance. Nothing runs until [`OutboxService::start`].
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for unusable settings or
    /// when the HTTP client cannot be built.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        lock: Arc<dyn LockBackend>,
        wake: Arc<dyn WakeChannel>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Result<Self> {
        validate_config(&config)?;
        let config = Arc::new(config);

        let client = DeliveryClient::new(config.client_config.clone())?;
        let executor = Executor::new(storage.clone(), client, clock.clone(), config.clone());
        let dispatcher = Arc::new(RwLock::new(Dispatcher::Dormant));
        let election = LeaderElection::new(
            lock,
            wake.clone(),
            executor.clone(),
            clock.clone(),
            config,
            dispatcher.clone(),
        );

        Ok(Self { storage, wake, clock, executor, dispatcher, election })
    }

    /// Starts competing for leadership.
    pub async fn start(&self) {
        self.election.start().await;
    }

    /// Stops the election loop, any running dispatcher and releases the lock.
    pub async fn stop(&self) {
        self.election.stop().await;
        info!("outbox service stopped");
    }

    /// Current role of this instance.
    pub fn role(&self) -> Role {
        self.election.role()
    }

    /// Whether this instance currently delivers messages.
    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Receiver notified on every role change.
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.election.subscribe_role()
    }

    /// Deadline currently armed on this instance, if leading.
    pub async fn armed_at(&self) -> Option<DateTime<Utc>> {
        self.dispatcher.read().await.armed_at()
    }

    /// Delivery counters of this instance.
    pub async fn stats(&self) -> DeliveryStats {
        self.executor.stats().await
    }

    /// Checks that the backing store answers.
    pub async fn health_check(&self) -> Result<()> {
        Ok(self.storage.health_check().await?)
    }

    /// Validates and stores a queue.
    pub async fn create_queue(&self, input: NewQueue) -> Result<Queue> {
        validate_queue(&input)?;
        if let Some(dlq) = input.dead_letter_queue_id {
            self.find_queue(dlq).await.map_err(|e| match e {
                DeliveryError::NotFound { .. } => {
                    DeliveryError::validation(format!("dead letter queue {dlq} does not exist"))
                },
                other => other,
            })?;
        }

        let queue = input.into_queue(self.clock.now());
        self.storage.create_queue(queue.clone()).await?;
        info!(queue_id = %queue.id, name = %queue.name, "queue created");
        Ok(queue)
    }

    /// Looks up a queue.
    pub async fn find_queue(&self, queue_id: QueueId) -> Result<Queue> {
        self.storage
            .find_queue(queue_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("queue {queue_id}")))
    }

    /// Stores messages in one transaction and schedules them.
    pub async fn enqueue(&self, inputs: Vec<NewMessage>) -> Result<Vec<Message>> {
        if inputs.is_empty() {
            return Err(DeliveryError::validation("at least one message is required"));
        }

        let queue_ids: HashSet<QueueId> = inputs.iter().map(|m| m.queue_id).collect();
        for queue_id in queue_ids {
            self.find_queue(queue_id).await?;
        }

        let now = self.clock.now();
        let messages: Vec<Message> = inputs.into_iter().map(|m| m.into_message(now)).collect();
        self.storage.insert_messages(messages.clone()).await?;
        debug!(count = messages.len(), "messages enqueued");

        self.on_messages_inserted(&messages).await;
        Ok(messages)
    }

    /// Looks up a message.
    pub async fn find_message(&self, message_id: MessageId) -> Result<Message> {
        self.storage
            .find_message(message_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("message {message_id}")))
    }

    /// Lists a queue's messages, most recently due first.
    pub async fn messages_for_queue(&self, queue_id: QueueId, limit: usize) -> Result<Vec<Message>> {
        self.find_queue(queue_id).await?;
        let limit = limit.clamp(1, MAX_LISTED_MESSAGES);
        Ok(self.storage.find_messages_by_queue(queue_id, limit).await?)
    }

    /// Validates a cron, stores it together with its first message and
    /// schedules that message.
    pub async fn create_cron(&self, input: NewCron) -> Result<(Cron, Message)> {
        let now = self.clock.now();
        let cron = input.into_cron(now);
        let first = first_message(&cron, now)?;
        self.find_queue(cron.queue_id).await?;

        self.storage.insert_cron(cron.clone(), first.clone()).await?;
        info!(cron_id = %cron.id, schedule = %cron.schedule, first_at = %first.when, "cron created");

        self.on_messages_inserted(std::slice::from_ref(&first)).await;
        Ok((cron, first))
    }

    /// Starts the message chain of a cron that was persisted without one.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidCron` if the expression does not parse
    /// or never fires again; nothing is inserted in that case.
    pub async fn on_cron_saved(&self, cron: &Cron) -> Result<Message> {
        let first = first_message(cron, self.clock.now())?;
        self.storage.insert_messages(vec![first.clone()]).await?;
        self.on_messages_inserted(std::slice::from_ref(&first)).await;
        Ok(first)
    }

    /// Arms the local dispatcher for the earliest of `messages` and signals
    /// the leader. Failures are logged; the leader's poll catches up anyway.
    pub async fn on_messages_inserted(&self, messages: &[Message]) {
        let Some(earliest) = messages.iter().map(|m| m.when).min() else {
            return;
        };

        self.dispatcher.read().await.arm(earliest);
        if let Err(e) = self.wake.publish().await {
            warn!(error = %e, "failed to publish wake signal");
        }
    }
}

impl std::fmt::Debug for OutboxService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxService").field("role", &self.role()).finish_non_exhaustive()
    }
}

fn first_message(cron: &Cron, now: DateTime<Utc>) -> Result<Message> {
    let when = CronSchedule::parse(&cron.schedule)?.next_after(now)?;
    Ok(cron.spawn_message(when, now))
}

fn validate_config(config: &DeliveryConfig) -> Result<()> {
    if config.batch_size == 0 {
        return Err(DeliveryError::configuration("batch_size must be at least 1"));
    }
    if config.poll_interval.is_zero() {
        return Err(DeliveryError::configuration("poll_interval must be positive"));
    }
    if config.max_dead_letter_hops < 0 {
        return Err(DeliveryError::configuration("max_dead_letter_hops must not be negative"));
    }
    if config.wake_channel.trim().is_empty() {
        return Err(DeliveryError::configuration("wake_channel must not be empty"));
    }
    Ok(())
}

fn validate_queue(input: &NewQueue) -> Result<()> {
    if input.name.trim().is_empty() {
        return Err(DeliveryError::validation("queue name must not be empty"));
    }

    let url = Url::parse(&input.callback_url)
        .map_err(|e| DeliveryError::validation(format!("invalid callback url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DeliveryError::validation(format!(
            "callback url must use http or https, got {}",
            url.scheme()
        )));
    }

    if input.method.is_empty() || Method::from_bytes(input.method.as_bytes()).is_err() {
        return Err(DeliveryError::validation(format!("invalid HTTP method '{}'", input.method)));
    }

    if let Some(max_retries) = input.max_retries {
        if max_retries < 1 {
            return Err(DeliveryError::validation(
                "max_retries must be greater or equal to one",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_validation_rejects_bad_input() {
        let ok = NewQueue::new("orders", "https://example.com/hook");
        assert!(validate_queue(&ok).is_ok());

        let mut zero_retries = ok.clone();
        zero_retries.max_retries = Some(0);
        assert!(matches!(validate_queue(&zero_retries), Err(DeliveryError::Validation { .. })));

        let ftp = NewQueue::new("orders", "ftp://example.com");
        assert!(validate_queue(&ftp).is_err());

        let relative = NewQueue::new("orders", "/hook");
        assert!(validate_queue(&relative).is_err());

        let mut bad_method = ok.clone();
        bad_method.method = "PO ST".to_string();
        assert!(validate_queue(&bad_method).is_err());

        let unnamed = NewQueue::new("  ", "https://example.com");
        assert!(validate_queue(&unnamed).is_err());
    }

    #[test]
    fn config_validation_rejects_zero_batch() {
        let config = DeliveryConfig { batch_size: 0, ..DeliveryConfig::default() };
        assert!(matches!(
            validate_config(&config),
            Err(DeliveryError::ConfigurationError { .. })
        ));
        assert!(validate_config(&DeliveryConfig::default()).is_ok());
    }
}
