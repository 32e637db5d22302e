//! Client side of the sync job lifecycle: start a job, poll it to completion.

pub mod api;
pub mod poller;

pub use api::{ClientError, HttpSyncApi, JobSnapshot, StartSyncParams, SyncApi};
pub use poller::{PollError, PollerState, SyncPoller, DEFAULT_POLL_INTERVAL};
