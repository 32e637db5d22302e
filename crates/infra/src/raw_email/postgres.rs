//! Postgres-backed raw email store.
//!
//! Rows are keyed by `(user_id, provider_message_id)`; the email itself is
//! kept as JSONB so provider fields can grow without migrations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use finsync_core::{EmailCategory, RawEmail, StoredEmail, UserId};

use super::{RawEmailStore, StoreError, UpsertOutcome};

pub struct PostgresRawEmailStore {
    pool: Arc<PgPool>,
}

impl PostgresRawEmailStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("{operation}: {e}"))
}

#[async_trait]
impl RawEmailStore for PostgresRawEmailStore {
    #[instrument(skip(self, email), fields(user_id = %user_id, message_id = %email.provider_message_id), err)]
    async fn upsert(&self, user_id: UserId, email: RawEmail) -> Result<UpsertOutcome, StoreError> {
        // xmax is 0 only for a freshly inserted tuple.
        let row = sqlx::query(
            r#"
            INSERT INTO raw_emails (user_id, provider_message_id, category, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, provider_message_id) DO UPDATE
            SET payload = jsonb_set(EXCLUDED.payload, '{category}', raw_emails.payload -> 'category'),
                updated_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(&email.provider_message_id)
        .bind(email.category.as_str())
        .bind(Json(&email))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_raw_email", e))?;

        let inserted: bool = row
            .try_get("inserted")
            .map_err(|e| map_sqlx_error("upsert_raw_email", e))?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn list(
        &self,
        user_id: UserId,
        category: Option<&EmailCategory>,
    ) -> Result<Vec<StoredEmail>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT payload, stored_at
            FROM raw_emails
            WHERE user_id = $1 AND ($2::text IS NULL OR category = $2)
            ORDER BY stored_at ASC, provider_message_id ASC
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(category.map(EmailCategory::as_str))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_raw_emails", e))?;

        rows.into_iter()
            .map(|row| {
                let Json(email): Json<RawEmail> = row
                    .try_get("payload")
                    .map_err(|e| map_sqlx_error("decode_raw_email", e))?;
                let stored_at: DateTime<Utc> = row
                    .try_get("stored_at")
                    .map_err(|e| map_sqlx_error("decode_raw_email", e))?;
                Ok(StoredEmail {
                    user_id,
                    email,
                    stored_at,
                })
            })
            .collect()
    }

    async fn count(&self, user_id: UserId) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_emails WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_raw_emails", e))?;
        Ok(count.max(0) as usize)
    }
}
