//! Database access layer implementing the repository pattern.
//!
//! Every SQL statement lives in one of the repositories below. Operations
//! that touch several tables in one transaction live on [`Storage`] itself so
//! the transaction boundary is visible at the call site.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

pub mod crons;
pub mod messages;
pub mod queues;
pub mod schema;

use crate::{
    error::Result,
    models::{Cron, Message, MessageTransition},
};

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<PgPool>,

    /// Repository for queue operations.
    pub queues: Arc<queues::Repository>,

    /// Repository for message operations.
    pub messages: Arc<messages::Repository>,

    /// Repository for cron operations.
    pub crons: Arc<crons::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            queues: Arc::new(queues::Repository::new(pool.clone())),
            messages: Arc::new(messages::Repository::new(pool.clone())),
            crons: Arc::new(crons::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Starts a transaction on the shared pool.
    ///
    /// # Errors
    ///
    /// Returns error if no connection can be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Inserts a batch of messages atomically.
    ///
    /// # Errors
    ///
    /// Returns error if any insert fails; nothing is persisted in that case.
    pub async fn insert_messages(&self, messages: &[Message]) -> Result<()> {
        let mut tx = self.begin().await?;
        for message in messages {
            self.messages.create_in_tx(&mut tx, message).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Inserts a cron together with its first message.
    ///
    /// # Errors
    ///
    /// Returns error if either insert fails; nothing is persisted in that
    /// case.
    pub async fn insert_cron(&self, cron: &Cron, first: &Message) -> Result<()> {
        let mut tx = self.begin().await?;
        self.crons.create_in_tx(&mut tx, cron).await?;
        self.messages.create_in_tx(&mut tx, first).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Applies the outcome of one delivery attempt.
    ///
    /// The message update and every follow-up insert commit together, so a
    /// crash leaves the message either untouched or fully advanced.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the message no longer exists, or a
    /// database error; the transaction is rolled back in both cases.
    pub async fn commit_transition(&self, transition: &MessageTransition) -> Result<()> {
        let mut tx = self.begin().await?;
        self.messages.apply_update_in_tx(&mut tx, transition.message_id, &transition.update).await?;
        for message in &transition.inserts {
            self.messages.create_in_tx(&mut tx, message).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}
