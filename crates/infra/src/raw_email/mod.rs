//! Raw Email Store: fetched emails persisted per user for idempotent re-processing.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use finsync_core::{EmailCategory, RawEmail, StoredEmail, UserId};

pub use in_memory::InMemoryRawEmailStore;
pub use postgres::PostgresRawEmailStore;

/// Whether an upsert created a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl UpsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted)
    }
}

/// Raw email store error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Raw email store abstraction.
#[async_trait]
pub trait RawEmailStore: Send + Sync {
    /// Insert or replace an email, keyed by `(user_id, provider_message_id)`.
    ///
    /// Replacing refreshes the content but keeps the original `stored_at` and
    /// category, so an email stays in the category it was first synced under.
    async fn upsert(&self, user_id: UserId, email: RawEmail) -> Result<UpsertOutcome, StoreError>;

    /// List a user's stored emails, optionally filtered by category, oldest first.
    async fn list(
        &self,
        user_id: UserId,
        category: Option<&EmailCategory>,
    ) -> Result<Vec<StoredEmail>, StoreError>;

    /// Number of emails stored for a user.
    async fn count(&self, user_id: UserId) -> Result<usize, StoreError>;
}
