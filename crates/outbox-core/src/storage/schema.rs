//! Schema bootstrap.
//!
//! Statements are idempotent and run at every startup.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "queues",
        r#"
        CREATE TABLE IF NOT EXISTS queues (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            callback_url TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'POST',
            headers JSONB NOT NULL DEFAULT '{}',
            max_retries INTEGER NOT NULL DEFAULT 10 CHECK (max_retries >= 1),
            dead_letter_queue_id UUID REFERENCES queues(id),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "crons",
        r#"
        CREATE TABLE IF NOT EXISTS crons (
            id UUID PRIMARY KEY,
            queue_id UUID NOT NULL REFERENCES queues(id),
            schedule TEXT NOT NULL,
            headers JSONB NOT NULL DEFAULT '{}',
            body TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "messages",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY,
            queue_id UUID NOT NULL REFERENCES queues(id),
            "when" TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            body TEXT,
            headers JSONB NOT NULL DEFAULT '{}',
            retries INTEGER NOT NULL DEFAULT 0,
            failed BOOLEAN NOT NULL DEFAULT false,
            sent_at TIMESTAMPTZ,
            cron_id UUID REFERENCES crons(id) ON DELETE SET NULL,
            dead_letter_hops INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "idx_messages_pending_when",
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_pending_when
        ON messages ("when")
        WHERE sent_at IS NULL AND failed = false
        "#,
    ),
    (
        "idx_messages_queue",
        "CREATE INDEX IF NOT EXISTS idx_messages_queue ON messages (queue_id)",
    ),
];

/// Creates tables and indexes if they do not exist.
///
/// # Errors
///
/// Returns error if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for (name, statement) in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
        debug!(object = name, "schema object ensured");
    }

    Ok(())
}
