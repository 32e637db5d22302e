//! Transport to the sync job API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use finsync_core::{progress_percent, SyncJobId, SyncJobStatus};

/// The fields of a sync job the poller cares about. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: SyncJobId,
    pub status: SyncJobStatus,
    #[serde(default)]
    pub total_emails: Option<u32>,
    #[serde(default)]
    pub processed_emails: u32,
    #[serde(default)]
    pub new_emails: u32,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl JobSnapshot {
    /// Placeholder shown between receiving a job id and the first poll.
    pub fn pending(id: SyncJobId) -> Self {
        Self {
            id,
            status: SyncJobStatus::Pending,
            total_emails: None,
            processed_emails: 0,
            new_emails: 0,
            error_message: None,
        }
    }

    pub fn progress_percent(&self) -> u8 {
        progress_percent(self.status, self.processed_emails, self.total_emails)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl StartSyncParams {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("a sync is already in progress")]
    SyncInProgress { job_id: Option<SyncJobId> },
    #[error("parse error: {0}")]
    Parse(String),
}

#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Start a sync job; returns its id without waiting for it to run.
    async fn start_sync(&self, params: &StartSyncParams) -> Result<SyncJobId, ClientError>;

    /// Fetch the current state of a job.
    async fn job_status(&self, job_id: SyncJobId) -> Result<JobSnapshot, ClientError>;
}

/// [`SyncApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSyncApi {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobAccepted {
    job_id: SyncJobId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    job_id: Option<SyncJobId>,
}

impl HttpSyncApi {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, token)
    }

    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn error_from(resp: reqwest::Response) -> ClientError {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let body: Option<ErrorBody> = serde_json::from_str(&text).ok();

        if status == StatusCode::CONFLICT {
            return ClientError::SyncInProgress {
                job_id: body.and_then(|b| b.job_id),
            };
        }
        ClientError::Api {
            status: status.as_u16(),
            message: body.and_then(|b| b.message).unwrap_or(text),
        }
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn start_sync(&self, params: &StartSyncParams) -> Result<SyncJobId, ClientError> {
        let resp = self
            .client
            .post(format!("{}/sync", self.api_url))
            .bearer_auth(&self.token)
            .json(params)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }

        let accepted: JobAccepted = resp
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(accepted.job_id)
    }

    async fn job_status(&self, job_id: SyncJobId) -> Result<JobSnapshot, ClientError> {
        let resp = self
            .client
            .get(format!("{}/sync/{}", self.api_url, job_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }

        resp.json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))
    }
}
