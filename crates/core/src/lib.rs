//! Domain building blocks for email ingestion runs.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).

pub mod email;
pub mod error;
pub mod id;
pub mod progress;
pub mod sync_job;

pub use email::{EmailCategory, RawEmail, StoredEmail};
pub use error::{DomainError, DomainResult};
pub use id::{SyncJobId, UserId};
pub use progress::progress_percent;
pub use sync_job::{failure_message, MAX_QUERY_LEN, SyncJob, SyncJobKind, SyncJobStatus};
