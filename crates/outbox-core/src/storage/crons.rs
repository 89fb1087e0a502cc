//! Repository for cron database operations.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Cron, CronId},
};

/// Repository for cron database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a cron within a transaction.
    ///
    /// The first message is inserted by the caller in the same transaction,
    /// see [`crate::storage::Storage::insert_cron`].
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        cron: &Cron,
    ) -> Result<CronId> {
        self.create_impl(&mut **tx, cron).await
    }

    async fn create_impl<'e, E>(&self, executor: E, cron: &Cron) -> Result<CronId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO crons (id, queue_id, schedule, headers, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(cron.id)
        .bind(cron.queue_id)
        .bind(&cron.schedule)
        .bind(sqlx::types::Json(&cron.headers))
        .bind(&cron.body)
        .bind(cron.created_at)
        .bind(cron.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a cron by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, cron_id: CronId) -> Result<Option<Cron>> {
        let cron = sqlx::query_as::<_, Cron>(
            r#"
            SELECT id, queue_id, schedule, headers, body, created_at, updated_at
            FROM crons
            WHERE id = $1
            "#,
        )
        .bind(cron_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(cron)
    }
}
