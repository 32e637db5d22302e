use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use finsync_core::{EmailCategory, RawEmail, SyncJob, SyncJobId};

use crate::app::errors;

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncRequest {
    pub query: Option<String>,
    pub cursor: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessRequest {
    pub category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub query: Option<String>,
    pub max_results: Option<usize>,
    pub category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: SyncJobId,
}

/// A job plus the progress percentage pollers display.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJobView {
    #[serde(flatten)]
    pub job: SyncJob,
    pub progress_percent: u8,
}

impl From<SyncJob> for SyncJobView {
    fn from(job: SyncJob) -> Self {
        let progress_percent = job.progress_percent();
        Self {
            job,
            progress_percent,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<SyncJobView>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub emails: Vec<RawEmail>,
}

// -------------------------
// Parsing helpers
// -------------------------

/// Parse an optional JSON body; an empty body yields the default request.
pub fn parse_body<T>(body: &[u8]) -> Result<T, axum::response::Response>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| errors::validation_error(format!("invalid request body: {e}")))
}

pub fn parse_category(raw: Option<String>) -> Result<Option<EmailCategory>, axum::response::Response> {
    raw.map(|c| EmailCategory::new(c.as_str()))
        .transpose()
        .map_err(|e| errors::validation_error(e.to_string()))
}

pub fn parse_job_id(raw: &str) -> Result<SyncJobId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::validation_error(format!("invalid job id: {raw}")))
}
