//! Database adapters: connection pool and schema wiring.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Connect a Postgres pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    info!(max_connections, "connected to postgres");
    Ok(pool)
}

/// Create tables and indexes if they do not exist yet.
///
/// `sync_jobs_one_active_per_user` is what enforces single-flight syncs
/// when several API instances share one database.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("database schema ready");
    Ok(())
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_jobs (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('sync', 'reprocess')),
        category TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'failed')),
        query TEXT,
        cursor TEXT,
        next_cursor TEXT,
        total_emails INTEGER CHECK (total_emails >= 0),
        processed_emails INTEGER NOT NULL DEFAULT 0 CHECK (processed_emails >= 0),
        new_emails INTEGER NOT NULL DEFAULT 0 CHECK (new_emails >= 0),
        transactions INTEGER NOT NULL DEFAULT 0,
        statements INTEGER NOT NULL DEFAULT 0,
        parse_failures INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        CHECK (total_emails IS NULL OR processed_emails <= total_emails),
        CHECK (new_emails <= processed_emails)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS sync_jobs_one_active_per_user
        ON sync_jobs (user_id)
        WHERE status IN ('pending', 'running')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS sync_jobs_user_created
        ON sync_jobs (user_id, created_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS raw_emails (
        user_id UUID NOT NULL,
        provider_message_id TEXT NOT NULL,
        category TEXT NOT NULL,
        payload JSONB NOT NULL,
        stored_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (user_id, provider_message_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS raw_emails_user_category
        ON raw_emails (user_id, category, stored_at)
    "#,
];
