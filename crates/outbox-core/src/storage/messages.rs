//! Repository for message database operations.
//!
//! Messages are only ever inserted or advanced, never deleted. The executor
//! reads due batches through [`Repository::find_due`] and writes outcomes
//! through [`Repository::apply_update_in_tx`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{DueMessage, Message, MessageId, MessageUpdate, QueueId},
};

const MESSAGE_COLUMNS: &str = r#"id, queue_id, "when", body, headers, retries, failed, sent_at,
    cron_id, dead_letter_hops, created_at, updated_at"#;

/// Repository for message database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a message.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the queue or cron does not
    /// exist.
    pub async fn create(&self, message: &Message) -> Result<MessageId> {
        self.create_impl(&*self.pool, message).await
    }

    /// Inserts a message within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &Message,
    ) -> Result<MessageId> {
        self.create_impl(&mut **tx, message).await
    }

    async fn create_impl<'e, E>(&self, executor: E, message: &Message) -> Result<MessageId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO messages (
                id, queue_id, "when", body, headers, retries, failed, sent_at,
                cron_id, dead_letter_hops, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(message.id)
        .bind(message.queue_id)
        .bind(message.when)
        .bind(&message.body)
        .bind(sqlx::types::Json(&message.headers))
        .bind(message.retries)
        .bind(message.failed)
        .bind(message.sent_at)
        .bind(message.cron_id)
        .bind(message.dead_letter_hops)
        .bind(message.created_at)
        .bind(message.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a message by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, message_id: MessageId) -> Result<Option<Message>> {
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let message = sqlx::query_as::<_, Message>(&query)
            .bind(message_id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(message)
    }

    /// Lists the messages of a queue, most recently due first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_queue(&self, queue_id: QueueId, limit: i64) -> Result<Vec<Message>> {
        let query = format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM messages
               WHERE queue_id = $1
               ORDER BY "when" DESC
               LIMIT $2"#
        );
        let messages = sqlx::query_as::<_, Message>(&query)
            .bind(queue_id)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        Ok(messages)
    }

    /// Fetches pending messages due at or before `now`, joined with the
    /// delivery settings of their queue.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<DueMessage>> {
        let due = sqlx::query_as::<_, DueMessage>(
            r#"
            SELECT m.id, m.queue_id, m."when", m.body, m.headers, m.retries, m.failed,
                   m.sent_at, m.cron_id, m.dead_letter_hops, m.created_at, m.updated_at,
                   q.callback_url, q.method, q.headers AS queue_headers, q.max_retries,
                   q.dead_letter_queue_id
            FROM messages m
            JOIN queues q ON q.id = m.queue_id
            WHERE m.sent_at IS NULL
              AND m.failed = false
              AND m."when" <= $1
            ORDER BY m."when" ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(due)
    }

    /// Returns the due time of the earliest pending message.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_soonest_pending(&self) -> Result<Option<DateTime<Utc>>> {
        let when = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT "when" FROM messages
            WHERE sent_at IS NULL AND failed = false
            ORDER BY "when" ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&*self.pool)
        .await?;

        Ok(when)
    }

    /// Applies a delivery outcome to a message within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no row was updated.
    pub async fn apply_update_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message_id: MessageId,
        update: &MessageUpdate,
    ) -> Result<()> {
        let query = match update {
            MessageUpdate::Sent { sent_at } => sqlx::query(
                r#"
                UPDATE messages
                SET sent_at = $2, updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(*sent_at),
            MessageUpdate::Retry { retries, when } => sqlx::query(
                r#"
                UPDATE messages
                SET retries = $2, "when" = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(*retries)
            .bind(*when),
            MessageUpdate::Failed { failed_at } => sqlx::query(
                r#"
                UPDATE messages
                SET failed = true, sent_at = $2, updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(message_id)
            .bind(*failed_at),
        };

        let result = query.execute(&mut **tx).await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("message {message_id} not found")));
        }

        Ok(())
    }
}
