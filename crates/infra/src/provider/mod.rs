//! Email Provider Gateway: list candidate message ids and fetch their content.
//!
//! ## Components
//!
//! - `EmailProvider`: gateway abstraction used by the sync service
//! - `GmailGateway`: Gmail REST v1 over reqwest
//! - `InMemoryMailbox`: deterministic mailbox for dev/tests

pub mod gmail;
pub mod in_memory;

use async_trait::async_trait;
use thiserror::Error;

use finsync_core::{RawEmail, UserId};

pub use gmail::{GmailGateway, StaticTokenSource, TokenSource};
pub use in_memory::InMemoryMailbox;

/// Result of a listing call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageListing {
    /// Candidate provider message ids, newest first.
    pub ids: Vec<String>,
    /// Cursor to resume incremental listing from on the next run.
    pub next_cursor: Option<String>,
}

/// Provider failure.
///
/// Every variant is "foreseeable": the sync service records it on the job
/// instead of propagating it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("mail provider authorization expired or was revoked")]
    AuthExpired,
    #[error("mail provider rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("mail provider request failed: {0}")]
    Network(String),
    #[error("mail provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("could not decode mail provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Short human-readable summary stored as a job's `error_message`.
    pub fn summary(&self) -> String {
        match self {
            ProviderError::AuthExpired => {
                "Mail provider authorization expired; reconnect the account".to_string()
            }
            ProviderError::RateLimited { retry_after_secs: Some(secs) } => {
                format!("Mail provider rate limit reached; retry in {secs}s")
            }
            ProviderError::RateLimited { retry_after_secs: None } => {
                "Mail provider rate limit reached; retry later".to_string()
            }
            other => format!("Mail provider error: {other}"),
        }
    }
}

/// Gateway abstraction over an external mail provider.
///
/// Calls are scoped by user because each user has their own mailbox and credentials.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// List message ids matching `query`, resuming from `cursor`, at most `max_results`.
    async fn list_messages(
        &self,
        user_id: UserId,
        query: Option<&str>,
        cursor: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<MessageListing, ProviderError>;

    /// Fetch one message's full content.
    async fn fetch_content(&self, user_id: UserId, id: &str) -> Result<RawEmail, ProviderError>;

    /// Fetch several messages as one grouped request.
    ///
    /// The default issues one fetch per id in order; gateways with a native
    /// batch endpoint override it.
    async fn fetch_content_batch(
        &self,
        user_id: UserId,
        ids: &[String],
    ) -> Result<Vec<RawEmail>, ProviderError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.fetch_content(user_id, id).await?);
        }
        Ok(out)
    }
}
