//! Repository for queue database operations.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Queue, QueueId},
};

/// Repository for queue database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a queue.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the dead-letter queue does
    /// not exist or `max_retries` is below one.
    pub async fn create(&self, queue: &Queue) -> Result<QueueId> {
        self.create_impl(&*self.pool, queue).await
    }

    /// Inserts a queue within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue: &Queue,
    ) -> Result<QueueId> {
        self.create_impl(&mut **tx, queue).await
    }

    async fn create_impl<'e, E>(&self, executor: E, queue: &Queue) -> Result<QueueId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO queues (
                id, name, callback_url, method, headers, max_retries,
                dead_letter_queue_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(queue.id)
        .bind(&queue.name)
        .bind(&queue.callback_url)
        .bind(&queue.method)
        .bind(sqlx::types::Json(&queue.headers))
        .bind(queue.max_retries)
        .bind(queue.dead_letter_queue_id)
        .bind(queue.created_at)
        .bind(queue.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a queue by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, queue_id: QueueId) -> Result<Option<Queue>> {
        let queue = sqlx::query_as::<_, Queue>(
            r#"
            SELECT id, name, callback_url, method, headers, max_retries,
                   dead_letter_queue_id, created_at, updated_at
            FROM queues
            WHERE id = $1
            "#,
        )
        .bind(queue_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(queue)
    }
}
