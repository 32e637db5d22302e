//! Sync job persistence and background execution.
//!
//! ## Components
//!
//! - `SyncJobRepository`: persistence for jobs (in-memory or Postgres)
//! - `SyncRunner`: runs accepted jobs as background tasks and drains them on shutdown
//! - `StaleJobReaper`: fails active jobs whose worker went away

pub mod postgres;
pub mod reaper;
pub mod runner;
pub mod store;

pub use postgres::PostgresSyncJobRepository;
pub use reaper::{ReaperHandle, StaleJobReaper, TIMED_OUT_MESSAGE};
pub use runner::{SyncRunner, INTERRUPTED_MESSAGE};
pub use store::{InMemorySyncJobRepository, RepositoryError, SyncJobRepository};
