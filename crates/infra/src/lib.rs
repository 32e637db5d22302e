//! Infrastructure layer: mail provider, stores, sync service and background tasks.

pub mod db;
pub mod jobs;
pub mod provider;
pub mod raw_email;
pub mod sync;
