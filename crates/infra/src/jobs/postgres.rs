//! Postgres-backed sync job repository.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation on `sync_jobs_one_active_per_user`) | `23505` | `ActiveJobExists` |
//! | Database (unique violation on primary key) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! Every query is scoped by `user_id`; a row owned by someone else is
//! reported as `UserIsolation`, never returned.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use finsync_core::{
    failure_message, EmailCategory, SyncJob, SyncJobId, SyncJobKind, SyncJobStatus, UserId,
};

use super::store::{RepositoryError, SyncJobRepository};

const ACTIVE_INDEX: &str = "sync_jobs_one_active_per_user";

const SELECT_COLUMNS: &str = r#"
    id, user_id, kind, category, status, query, cursor, next_cursor,
    total_emails, processed_emails, new_emails, transactions, statements,
    parse_failures, error_message, started_at, completed_at, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresSyncJobRepository {
    pool: Arc<PgPool>,
}

impl PostgresSyncJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn owner_of(&self, job_id: SyncJobId) -> Result<Option<Uuid>, RepositoryError> {
        sqlx::query_scalar("SELECT user_id FROM sync_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("owner_of", e))
    }
}

#[async_trait]
impl SyncJobRepository for PostgresSyncJobRepository {
    #[instrument(skip(self, job), fields(job_id = %job.id, user_id = %job.user_id), err)]
    async fn insert(&self, job: &SyncJob) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, user_id, kind, category, status, query, cursor, next_cursor,
                total_emails, processed_emails, new_emails, transactions, statements,
                parse_failures, error_message, started_at, completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.kind.as_str())
        .bind(job.category.as_str())
        .bind(job.status.as_str())
        .bind(&job.query)
        .bind(&job.cursor)
        .bind(&job.next_cursor)
        .bind(job.total_emails.map(to_db_count))
        .bind(to_db_count(job.processed_emails))
        .bind(to_db_count(job.new_emails))
        .bind(to_db_count(job.transactions))
        .bind(to_db_count(job.statements))
        .bind(to_db_count(job.parse_failures))
        .bind(&job.error_message)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation_on(&e, ACTIVE_INDEX) => {
                let active = self.find_active(job.user_id).await?;
                // The active job may have finished in between; report it anyway.
                Err(RepositoryError::ActiveJobExists(
                    active.map(|j| j.id).unwrap_or(job.id),
                ))
            }
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("insert_sync_job", e)),
        }
    }

    #[instrument(skip(self), fields(user_id = %user_id, job_id = %job_id), err)]
    async fn get(&self, user_id: UserId, job_id: SyncJobId) -> Result<Option<SyncJob>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM sync_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_sync_job", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = decode(&row)?;
        if job.user_id != user_id {
            return Err(RepositoryError::UserIsolation);
        }
        Ok(Some(job))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn save(&self, job: &SyncJob) -> Result<(), RepositoryError> {
        // Only active rows can change; a terminal row is final.
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET
                category = $3,
                status = $4,
                next_cursor = $5,
                total_emails = $6,
                processed_emails = $7,
                new_emails = $8,
                transactions = $9,
                statements = $10,
                parse_failures = $11,
                error_message = $12,
                started_at = $13,
                completed_at = $14,
                updated_at = $15
            WHERE id = $1 AND user_id = $2 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.category.as_str())
        .bind(job.status.as_str())
        .bind(&job.next_cursor)
        .bind(job.total_emails.map(to_db_count))
        .bind(to_db_count(job.processed_emails))
        .bind(to_db_count(job.new_emails))
        .bind(to_db_count(job.transactions))
        .bind(to_db_count(job.statements))
        .bind(to_db_count(job.parse_failures))
        .bind(&job.error_message)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_sync_job", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.owner_of(job.id).await? {
            None => Err(RepositoryError::NotFound(job.id)),
            Some(owner) if owner != *job.user_id.as_uuid() => Err(RepositoryError::UserIsolation),
            Some(_) => Err(RepositoryError::AlreadyTerminal(job.id)),
        }
    }

    #[instrument(skip(self), fields(user_id = %user_id, job_id = %job_id), err)]
    async fn fail_active(
        &self,
        user_id: UserId,
        job_id: SyncJobId,
        message: &str,
        not_updated_since: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        // Single statement so a concurrent progress write is never overwritten.
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET
                status = 'failed',
                error_message = $3,
                completed_at = GREATEST(updated_at, $4),
                updated_at = GREATEST(updated_at, $4)
            WHERE id = $1 AND user_id = $2 AND status IN ('pending', 'running')
              AND ($5::timestamptz IS NULL OR updated_at < $5)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(failure_message(message))
        .bind(Utc::now())
        .bind(not_updated_since)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_sync_job", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.owner_of(job_id).await? {
            None => Err(RepositoryError::NotFound(job_id)),
            Some(owner) if owner != *user_id.as_uuid() => Err(RepositoryError::UserIsolation),
            Some(_) => Ok(false),
        }
    }

    async fn find_active(&self, user_id: UserId) -> Result<Option<SyncJob>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_jobs \
             WHERE user_id = $1 AND status IN ('pending', 'running') LIMIT 1"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active_sync_job", e))?;

        row.as_ref().map(decode).transpose()
    }

    async fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<SyncJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_jobs \
             WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(user_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_sync_jobs", e))?;

        rows.iter().map(decode).collect()
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<SyncJob>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_jobs \
             WHERE status IN ('pending', 'running') AND updated_at < $1 ORDER BY updated_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale_sync_jobs", e))?;

        rows.iter().map(decode).collect()
    }
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<SyncJob, RepositoryError> {
    SyncJobRow::from_row(row)
        .map_err(|e| RepositoryError::Storage(format!("failed to deserialize sync job row: {e}")))?
        .try_into()
}

/// Internal row type for decoding `sync_jobs`.
#[derive(Debug)]
struct SyncJobRow {
    id: Uuid,
    user_id: Uuid,
    kind: String,
    category: String,
    status: String,
    query: Option<String>,
    cursor: Option<String>,
    next_cursor: Option<String>,
    total_emails: Option<i32>,
    processed_emails: i32,
    new_emails: i32,
    transactions: i32,
    statements: i32,
    parse_failures: i32,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SyncJobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SyncJobRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            kind: row.try_get("kind")?,
            category: row.try_get("category")?,
            status: row.try_get("status")?,
            query: row.try_get("query")?,
            cursor: row.try_get("cursor")?,
            next_cursor: row.try_get("next_cursor")?,
            total_emails: row.try_get("total_emails")?,
            processed_emails: row.try_get("processed_emails")?,
            new_emails: row.try_get("new_emails")?,
            transactions: row.try_get("transactions")?,
            statements: row.try_get("statements")?,
            parse_failures: row.try_get("parse_failures")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = RepositoryError;

    fn try_from(row: SyncJobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |field: &str, e: finsync_core::DomainError| {
            RepositoryError::Storage(format!("invalid {field} in sync job {id}: {e}"))
        };
        let status: SyncJobStatus = row.status.parse().map_err(|e| corrupt("status", e))?;
        let kind: SyncJobKind = row.kind.parse().map_err(|e| corrupt("kind", e))?;
        let category = EmailCategory::new(row.category.as_str()).map_err(|e| corrupt("category", e))?;

        Ok(SyncJob {
            id: SyncJobId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            kind,
            category,
            status,
            query: row.query,
            cursor: row.cursor,
            next_cursor: row.next_cursor,
            total_emails: row.total_emails.map(from_db_count),
            processed_emails: from_db_count(row.processed_emails),
            new_emails: from_db_count(row.new_emails),
            transactions: from_db_count(row.transactions),
            statements: from_db_count(row.statements),
            parse_failures: from_db_count(row.parse_failures),
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => RepositoryError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            RepositoryError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn is_unique_violation_on(err: &sqlx::Error, constraint: &str) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
    )
}
