//! Storage abstraction layer for the delivery engine.
//!
//! Provides trait-based abstractions over storage operations to enable
//! testability without database dependencies. Production code uses
//! [`PostgresDeliveryStorage`], a thin adapter over
//! `outbox_core::storage::Storage`; tests use [`mock::MockDeliveryStorage`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use outbox_core::{
    error::Result,
    models::{Cron, CronId, DueMessage, Message, MessageId, MessageTransition, Queue, QueueId},
    storage::Storage,
};

/// Boxed future returned by [`DeliveryStorage`] methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the scheduler, executor and service.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Returns up to `limit` pending messages due at or before `now`, joined
    /// with their queue's delivery settings, earliest first.
    fn find_due_messages(&self, now: DateTime<Utc>, limit: usize)
        -> StorageFuture<'_, Vec<DueMessage>>;

    /// Applies a message update and its follow-up inserts atomically.
    fn commit_transition(&self, transition: MessageTransition) -> StorageFuture<'_, ()>;

    /// Finds a cron by ID.
    fn find_cron(&self, cron_id: CronId) -> StorageFuture<'_, Option<Cron>>;

    /// Returns the due time of the earliest pending message.
    fn find_soonest_pending(&self) -> StorageFuture<'_, Option<DateTime<Utc>>>;

    /// Inserts a queue.
    fn create_queue(&self, queue: Queue) -> StorageFuture<'_, ()>;

    /// Finds a queue by ID.
    fn find_queue(&self, queue_id: QueueId) -> StorageFuture<'_, Option<Queue>>;

    /// Inserts messages atomically.
    fn insert_messages(&self, messages: Vec<Message>) -> StorageFuture<'_, ()>;

    /// Inserts a cron and its first message atomically.
    fn insert_cron(&self, cron: Cron, first: Message) -> StorageFuture<'_, ()>;

    /// Finds a message by ID.
    fn find_message(&self, message_id: MessageId) -> StorageFuture<'_, Option<Message>>;

    /// Lists messages on a queue, most recently due first.
    fn find_messages_by_queue(
        &self,
        queue_id: QueueId,
        limit: usize,
    ) -> StorageFuture<'_, Vec<Message>>;

    /// Verifies the backing store is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

fn as_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<DueMessage>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.find_due(now, as_limit(limit)).await })
    }

    fn commit_transition(&self, transition: MessageTransition) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.commit_transition(&transition).await })
    }

    fn find_cron(&self, cron_id: CronId) -> StorageFuture<'_, Option<Cron>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.crons.find_by_id(cron_id).await })
    }

    fn find_soonest_pending(&self) -> StorageFuture<'_, Option<DateTime<Utc>>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.find_soonest_pending().await })
    }

    fn create_queue(&self, queue: Queue) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queues.create(&queue).await.map(|_| ()) })
    }

    fn find_queue(&self, queue_id: QueueId) -> StorageFuture<'_, Option<Queue>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queues.find_by_id(queue_id).await })
    }

    fn insert_messages(&self, messages: Vec<Message>) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.insert_messages(&messages).await })
    }

    fn insert_cron(&self, cron: Cron, first: Message) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.insert_cron(&cron, &first).await })
    }

    fn find_message(&self, message_id: MessageId) -> StorageFuture<'_, Option<Message>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.find_by_id(message_id).await })
    }

    fn find_messages_by_queue(
        &self,
        queue_id: QueueId,
        limit: usize,
    ) -> StorageFuture<'_, Vec<Message>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.find_by_queue(queue_id, as_limit(limit)).await })
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory storage with the same semantics as the PostgreSQL schema.
    //!
    //! Foreign keys and the `max_retries >= 1` check are enforced so tests
    //! see the same constraint violations production would. Errors can be
    //! injected per operation to simulate an unavailable database.

    use std::{collections::HashMap, sync::Arc};

    use chrono::{DateTime, Utc};
    use outbox_core::{
        error::{CoreError, Result},
        models::{
            Cron, CronId, DueMessage, Message, MessageId, MessageTransition, MessageUpdate, Queue,
            QueueId,
        },
    };
    use tokio::sync::RwLock;

    use super::{DeliveryStorage, StorageFuture};

    #[derive(Default)]
    struct State {
        queues: HashMap<QueueId, Queue>,
        messages: HashMap<MessageId, Message>,
        crons: HashMap<CronId, Cron>,
        commits: u64,
    }

    impl State {
        fn check_message(&self, message: &Message) -> Result<()> {
            if !self.queues.contains_key(&message.queue_id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "foreign key constraint violation: queue {} does not exist",
                    message.queue_id
                )));
            }
            if let Some(cron_id) = message.cron_id {
                if !self.crons.contains_key(&cron_id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "foreign key constraint violation: cron {cron_id} does not exist"
                    )));
                }
            }
            if self.messages.contains_key(&message.id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "unique constraint violation: message {} exists",
                    message.id
                )));
            }
            Ok(())
        }
    }

    /// Injected failures, each consumed by the next matching call.
    #[derive(Default)]
    struct Faults {
        due: Option<String>,
        commits: Vec<String>,
        soonest: Option<String>,
        health: Option<String>,
    }

    /// Mock storage for testing delivery logic without database.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        state: Arc<RwLock<State>>,
        faults: Arc<RwLock<Faults>>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next due-message query fail.
        pub async fn inject_due_error(&self, error: impl Into<String>) {
            self.faults.write().await.due = Some(error.into());
        }

        /// Makes the next `count` commits fail and roll back.
        pub async fn inject_commit_errors(&self, count: usize, error: impl Into<String>) {
            let error = error.into();
            self.faults.write().await.commits.extend(std::iter::repeat(error).take(count));
        }

        /// Makes the next soonest-pending query fail.
        pub async fn inject_soonest_error(&self, error: impl Into<String>) {
            self.faults.write().await.soonest = Some(error.into());
        }

        /// Makes the next health check fail.
        pub async fn inject_health_error(&self, error: impl Into<String>) {
            self.faults.write().await.health = Some(error.into());
        }

        /// Returns every stored message.
        pub async fn all_messages(&self) -> Vec<Message> {
            let mut messages: Vec<_> = self.state.read().await.messages.values().cloned().collect();
            messages.sort_by_key(|m| (m.when, m.created_at));
            messages
        }

        /// Returns the messages spawned by a cron, oldest first.
        pub async fn messages_for_cron(&self, cron_id: CronId) -> Vec<Message> {
            let mut messages: Vec<_> = self
                .state
                .read()
                .await
                .messages
                .values()
                .filter(|m| m.cron_id == Some(cron_id))
                .cloned()
                .collect();
            messages.sort_by_key(|m| m.when);
            messages
        }

        /// Number of successful commits so far.
        pub async fn commit_count(&self) -> u64 {
            self.state.read().await.commits
        }

        /// Removes a cron, as an operator would; spawned messages keep a
        /// dangling reference.
        pub async fn remove_cron(&self, cron_id: CronId) {
            self.state.write().await.crons.remove(&cron_id);
        }

        /// Overwrites a cron expression, bypassing validation.
        pub async fn corrupt_cron_schedule(&self, cron_id: CronId, schedule: impl Into<String>) {
            if let Some(cron) = self.state.write().await.crons.get_mut(&cron_id) {
                cron.schedule = schedule.into();
            }
        }

        /// Overwrites a queue's retry limit, bypassing the check constraint.
        pub async fn corrupt_max_retries(&self, queue_id: QueueId, max_retries: i32) {
            if let Some(queue) = self.state.write().await.queues.get_mut(&queue_id) {
                queue.max_retries = max_retries;
            }
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_due_messages(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<DueMessage>> {
            Box::pin(async move {
                if let Some(error) = self.faults.write().await.due.take() {
                    return Err(CoreError::Database(error));
                }

                let state = self.state.read().await;
                let mut due: Vec<DueMessage> = state
                    .messages
                    .values()
                    .filter(|m| m.is_pending() && m.when <= now)
                    .filter_map(|m| {
                        state.queues.get(&m.queue_id).map(|q| DueMessage::new(m.clone(), q))
                    })
                    .collect();
                due.sort_by_key(|d| d.message.when);
                due.truncate(limit);
                Ok(due)
            })
        }

        fn commit_transition(&self, transition: MessageTransition) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let injected = {
                    let mut faults = self.faults.write().await;
                    if faults.commits.is_empty() {
                        None
                    } else {
                        Some(faults.commits.remove(0))
                    }
                };
                if let Some(error) = injected {
                    return Err(CoreError::Database(error));
                }

                let mut state = self.state.write().await;
                if !state.messages.contains_key(&transition.message_id) {
                    return Err(CoreError::NotFound(format!(
                        "message {} not found",
                        transition.message_id
                    )));
                }
                for message in &transition.inserts {
                    state.check_message(message)?;
                }

                if let Some(message) = state.messages.get_mut(&transition.message_id) {
                    match transition.update {
                        MessageUpdate::Sent { sent_at } => {
                            message.sent_at = Some(sent_at);
                            message.updated_at = sent_at;
                        },
                        MessageUpdate::Retry { retries, when } => {
                            message.retries = retries;
                            message.when = when;
                        },
                        MessageUpdate::Failed { failed_at } => {
                            message.failed = true;
                            message.sent_at = Some(failed_at);
                            message.updated_at = failed_at;
                        },
                    }
                }
                for message in transition.inserts {
                    state.messages.insert(message.id, message);
                }
                state.commits += 1;
                Ok(())
            })
        }

        fn find_cron(&self, cron_id: CronId) -> StorageFuture<'_, Option<Cron>> {
            Box::pin(async move { Ok(self.state.read().await.crons.get(&cron_id).cloned()) })
        }

        fn find_soonest_pending(&self) -> StorageFuture<'_, Option<DateTime<Utc>>> {
            Box::pin(async move {
                if let Some(error) = self.faults.write().await.soonest.take() {
                    return Err(CoreError::Database(error));
                }
                let state = self.state.read().await;
                Ok(state.messages.values().filter(|m| m.is_pending()).map(|m| m.when).min())
            })
        }

        fn create_queue(&self, queue: Queue) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if queue.max_retries < 1 {
                    return Err(CoreError::ConstraintViolation(
                        "check constraint violation: max_retries must be >= 1".to_string(),
                    ));
                }
                if let Some(dlq) = queue.dead_letter_queue_id {
                    if dlq != queue.id && !state.queues.contains_key(&dlq) {
                        return Err(CoreError::ConstraintViolation(format!(
                            "foreign key constraint violation: queue {dlq} does not exist"
                        )));
                    }
                }
                if state.queues.contains_key(&queue.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "unique constraint violation: queue {} exists",
                        queue.id
                    )));
                }
                state.queues.insert(queue.id, queue);
                Ok(())
            })
        }

        fn find_queue(&self, queue_id: QueueId) -> StorageFuture<'_, Option<Queue>> {
            Box::pin(async move { Ok(self.state.read().await.queues.get(&queue_id).cloned()) })
        }

        fn insert_messages(&self, messages: Vec<Message>) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                for message in &messages {
                    state.check_message(message)?;
                }
                for message in messages {
                    state.messages.insert(message.id, message);
                }
                Ok(())
            })
        }

        fn insert_cron(&self, cron: Cron, first: Message) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if !state.queues.contains_key(&cron.queue_id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "foreign key constraint violation: queue {} does not exist",
                        cron.queue_id
                    )));
                }
                state.crons.insert(cron.id, cron.clone());
                if let Err(e) = state.check_message(&first) {
                    state.crons.remove(&cron.id);
                    return Err(e);
                }
                state.messages.insert(first.id, first);
                Ok(())
            })
        }

        fn find_message(&self, message_id: MessageId) -> StorageFuture<'_, Option<Message>> {
            Box::pin(async move { Ok(self.state.read().await.messages.get(&message_id).cloned()) })
        }

        fn find_messages_by_queue(
            &self,
            queue_id: QueueId,
            limit: usize,
        ) -> StorageFuture<'_, Vec<Message>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let mut messages: Vec<_> =
                    state.messages.values().filter(|m| m.queue_id == queue_id).cloned().collect();
                messages.sort_by(|a, b| b.when.cmp(&a.when));
                messages.truncate(limit);
                Ok(messages)
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                match self.faults.write().await.health.take() {
                    Some(error) => Err(CoreError::Database(error)),
                    None => Ok(()),
                }
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use chrono::Duration;
        use outbox_core::models::{NewMessage, NewQueue};

        use super::*;

        async fn storage_with_queue() -> (MockDeliveryStorage, Queue) {
            let storage = MockDeliveryStorage::new();
            let queue = NewQueue::new("q", "http://localhost/hook").into_queue(Utc::now());
            storage.create_queue(queue.clone()).await.unwrap();
            (storage, queue)
        }

        #[tokio::test]
        async fn due_query_filters_and_orders() {
            let (storage, queue) = storage_with_queue().await;
            let now = Utc::now();
            let late = NewMessage::new(queue.id).due_at(now - Duration::seconds(1)).into_message(now);
            let early = NewMessage::new(queue.id).due_at(now - Duration::seconds(5)).into_message(now);
            let future = NewMessage::new(queue.id).due_at(now + Duration::hours(1)).into_message(now);
            storage.insert_messages(vec![late.clone(), early.clone(), future]).await.unwrap();

            let due = storage.find_due_messages(now, 10).await.unwrap();

            let ids: Vec<_> = due.iter().map(|d| d.message.id).collect();
            assert_eq!(ids, vec![early.id, late.id]);
            assert_eq!(due[0].callback_url, queue.callback_url);
        }

        #[tokio::test]
        async fn message_for_unknown_queue_is_rejected() {
            let storage = MockDeliveryStorage::new();
            let message = NewMessage::new(QueueId::new()).into_message(Utc::now());

            let err = storage.insert_messages(vec![message]).await.unwrap_err();
            assert!(matches!(err, CoreError::ConstraintViolation(_)));
        }

        #[tokio::test]
        async fn failed_commit_leaves_message_untouched() {
            let (storage, queue) = storage_with_queue().await;
            let now = Utc::now();
            let message = NewMessage::new(queue.id).into_message(now);
            storage.insert_messages(vec![message.clone()]).await.unwrap();
            storage.inject_commit_errors(1, "connection reset").await;

            let transition = MessageTransition::new(message.id, MessageUpdate::Sent { sent_at: now });
            assert!(storage.commit_transition(transition.clone()).await.is_err());
            assert!(storage.find_message(message.id).await.unwrap().unwrap().is_pending());

            storage.commit_transition(transition).await.unwrap();
            assert!(!storage.find_message(message.id).await.unwrap().unwrap().is_pending());
            assert_eq!(storage.commit_count().await, 1);
        }

        #[tokio::test]
        async fn commit_with_invalid_insert_is_rolled_back() {
            let (storage, queue) = storage_with_queue().await;
            let now = Utc::now();
            let message = NewMessage::new(queue.id).into_message(now);
            storage.insert_messages(vec![message.clone()]).await.unwrap();

            let mut transition =
                MessageTransition::new(message.id, MessageUpdate::Failed { failed_at: now });
            transition.insert(NewMessage::new(QueueId::new()).into_message(now));

            assert!(storage.commit_transition(transition).await.is_err());
            assert!(storage.find_message(message.id).await.unwrap().unwrap().is_pending());
        }

        #[tokio::test]
        async fn queue_with_zero_retries_is_rejected() {
            let storage = MockDeliveryStorage::new();
            let mut input = NewQueue::new("q", "http://localhost/hook");
            input.max_retries = Some(0);

            let err = storage.create_queue(input.into_queue(Utc::now())).await.unwrap_err();
            assert!(matches!(err, CoreError::ConstraintViolation(_)));
        }
    }
}
