//! Email Sync Service: orchestrates one ingestion run end to end.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use finsync_core::{
    DomainError, EmailCategory, RawEmail, SyncJob, SyncJobId, SyncJobKind, UserId, MAX_QUERY_LEN,
};

use crate::jobs::{RepositoryError, StaleJobReaper, SyncJobRepository};
use crate::provider::{EmailProvider, ProviderError};
use crate::raw_email::{RawEmailStore, StoreError};

use super::parser::{EmailParser, ParsedEmail};
use super::settings::{SyncSettings, PREVIEW_LIMIT};

/// Sync service error.
///
/// Provider failures during a run are recorded on the job rather than
/// returned; they only surface here from preview fetches.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters of a provider sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    pub query: Option<String>,
    pub cursor: Option<String>,
    pub category: Option<EmailCategory>,
}

impl SyncRequest {
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_category(mut self, category: EmailCategory) -> Self {
        self.category = Some(category);
        self
    }
}

pub struct EmailSyncService {
    provider: Arc<dyn EmailProvider>,
    emails: Arc<dyn RawEmailStore>,
    jobs: Arc<dyn SyncJobRepository>,
    parser: Option<Arc<dyn EmailParser>>,
    reaper: StaleJobReaper,
    settings: SyncSettings,
}

impl EmailSyncService {
    pub fn new(
        provider: Arc<dyn EmailProvider>,
        emails: Arc<dyn RawEmailStore>,
        jobs: Arc<dyn SyncJobRepository>,
        settings: SyncSettings,
    ) -> Self {
        let reaper = StaleJobReaper::new(jobs.clone(), settings.stale_after);
        Self {
            provider,
            emails,
            jobs,
            parser: None,
            reaper,
            settings,
        }
    }

    /// Parse stored emails during runs.
    pub fn with_parser(mut self, parser: Arc<dyn EmailParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn reaper(&self) -> &StaleJobReaper {
        &self.reaper
    }

    /// Create and persist a pending sync job.
    ///
    /// A stale active job for the user is failed first; a live one makes this
    /// return `RepositoryError::ActiveJobExists`.
    pub async fn start_sync(&self, user_id: UserId, request: SyncRequest) -> Result<SyncJob, SyncError> {
        let category = request
            .category
            .unwrap_or_else(|| self.settings.default_category.clone());
        let job = SyncJob::new(user_id, request.query, request.cursor)?.with_category(category);
        self.insert(job).await
    }

    /// Create and persist a pending reprocess job.
    pub async fn start_reprocess(
        &self,
        user_id: UserId,
        category: Option<EmailCategory>,
    ) -> Result<SyncJob, SyncError> {
        let category = category.unwrap_or_else(|| self.settings.default_category.clone());
        self.insert(SyncJob::reprocess(user_id, category)).await
    }

    async fn insert(&self, job: SyncJob) -> Result<SyncJob, SyncError> {
        self.reaper.reap_user(job.user_id, Utc::now()).await?;
        self.jobs.insert(&job).await?;
        info!(job_id = %job.id, user_id = %job.user_id, kind = %job.kind, "sync job created");
        Ok(job)
    }

    /// Start a sync and run it to completion.
    ///
    /// If the run errors, the job is marked failed before the error is returned.
    pub async fn run_sync(&self, user_id: UserId, request: SyncRequest) -> Result<SyncJob, SyncError> {
        let job = self.start_sync(user_id, request).await?;
        self.execute_or_fail(job).await
    }

    /// Start a reprocess and run it to completion.
    pub async fn reprocess(
        &self,
        user_id: UserId,
        category: Option<EmailCategory>,
    ) -> Result<SyncJob, SyncError> {
        let job = self.start_reprocess(user_id, category).await?;
        self.execute_or_fail(job).await
    }

    async fn execute_or_fail(&self, job: SyncJob) -> Result<SyncJob, SyncError> {
        let (user_id, job_id) = (job.user_id, job.id);
        match self.execute(job).await {
            Ok(job) => Ok(job),
            Err(e) => {
                warn!(job_id = %job_id, user_id = %user_id, error = %e, "sync run errored");
                if let Err(fail_err) = self.fail_job(user_id, job_id, &format!("sync failed: {e}")).await {
                    warn!(job_id = %job_id, error = %fail_err, "could not mark sync job failed");
                }
                Err(e)
            }
        }
    }

    /// Drive a pending job to a terminal state.
    ///
    /// Provider failures end the job as `failed` and still return `Ok`.
    /// Any other error is returned with the job left active; the caller is
    /// expected to call [`fail_job`](Self::fail_job).
    pub async fn execute(&self, mut job: SyncJob) -> Result<SyncJob, SyncError> {
        // Persisted together with the total, so no snapshot shows the
        // indeterminate percentage right before a lower known one.
        job.mark_running()?;
        info!(job_id = %job.id, user_id = %job.user_id, kind = %job.kind, "sync job running");

        let job = match job.kind {
            SyncJobKind::Sync => self.execute_sync(job).await?,
            SyncJobKind::Reprocess => self.execute_reprocess(job).await?,
        };

        info!(
            job_id = %job.id,
            status = %job.status,
            total = job.total_emails.unwrap_or(0),
            processed = job.processed_emails,
            new = job.new_emails,
            parse_failures = job.parse_failures,
            "sync job finished"
        );
        Ok(job)
    }

    async fn execute_sync(&self, mut job: SyncJob) -> Result<SyncJob, SyncError> {
        let user_id = job.user_id;
        let listed = self
            .provider
            .list_messages(
                user_id,
                job.query.as_deref(),
                job.cursor.as_deref(),
                Some(self.settings.max_results),
            )
            .await;
        let listing = match listed {
            Ok(listing) => listing,
            Err(e) => return self.fail_with_provider_error(job, e).await,
        };

        let mut ids = listing.ids;
        ids.truncate(self.settings.max_results);
        job.set_total(count(ids.len()))?;
        self.jobs.save(&job).await?;

        for batch in ids.chunks(self.settings.batch_size) {
            let fetched = match self.provider.fetch_content_batch(user_id, batch).await {
                Ok(fetched) => fetched,
                Err(e) => return self.fail_with_provider_error(job, e).await,
            };

            for email in fetched {
                let email = email.tagged(job.category.clone());
                let outcome = self.emails.upsert(user_id, email.clone()).await?;
                job.record_processed(outcome.is_new())?;
                self.parse_into(&mut job, &email)?;
            }
            // One write per batch keeps every persisted snapshot consistent.
            self.jobs.save(&job).await?;
        }

        job.mark_completed(listing.next_cursor)?;
        self.jobs.save(&job).await?;
        Ok(job)
    }

    async fn execute_reprocess(&self, mut job: SyncJob) -> Result<SyncJob, SyncError> {
        let stored = self.emails.list(job.user_id, Some(&job.category)).await?;
        job.set_total(count(stored.len()))?;
        self.jobs.save(&job).await?;

        for batch in stored.chunks(self.settings.batch_size) {
            for stored in batch {
                job.record_processed(false)?;
                self.parse_into(&mut job, &stored.email)?;
            }
            self.jobs.save(&job).await?;
        }

        job.mark_completed(None)?;
        self.jobs.save(&job).await?;
        Ok(job)
    }

    fn parse_into(&self, job: &mut SyncJob, email: &RawEmail) -> Result<(), DomainError> {
        let Some(parser) = &self.parser else {
            return Ok(());
        };
        match parser.parse(email) {
            Ok(ParsedEmail::Transaction { .. }) => job.record_transaction(),
            Ok(ParsedEmail::Statement) => job.record_statement(),
            Ok(ParsedEmail::Ignored) => Ok(()),
            Err(e) => {
                debug!(
                    job_id = %job.id,
                    message_id = %email.provider_message_id,
                    error = %e,
                    "email could not be parsed"
                );
                job.record_parse_failure()
            }
        }
    }

    async fn fail_with_provider_error(
        &self,
        mut job: SyncJob,
        error: ProviderError,
    ) -> Result<SyncJob, SyncError> {
        warn!(job_id = %job.id, user_id = %job.user_id, error = %error, "mail provider failed");
        job.mark_failed(error.summary())?;
        self.jobs.save(&job).await?;
        Ok(job)
    }

    /// Mark an active job failed. Returns `false` when it had already finished.
    pub async fn fail_job(
        &self,
        user_id: UserId,
        job_id: SyncJobId,
        message: &str,
    ) -> Result<bool, SyncError> {
        let failed = self.jobs.fail_active(user_id, job_id, message, None).await?;
        if failed {
            info!(job_id = %job_id, user_id = %user_id, error = %message, "sync job failed");
        }
        Ok(failed)
    }

    /// Fetch a small sample of matching emails without creating a job or storing anything.
    ///
    /// `max_results` above the preview limit is clamped; zero is rejected.
    pub async fn fetch_preview_emails(
        &self,
        user_id: UserId,
        query: Option<&str>,
        max_results: usize,
        category: Option<EmailCategory>,
    ) -> Result<Vec<RawEmail>, SyncError> {
        if max_results == 0 {
            return Err(DomainError::validation("maxResults must be at least 1").into());
        }
        if query.is_some_and(|q| q.chars().count() > MAX_QUERY_LEN) {
            return Err(DomainError::validation(format!(
                "query must be at most {MAX_QUERY_LEN} characters"
            ))
            .into());
        }
        let limit = max_results.min(PREVIEW_LIMIT);
        let category = category.unwrap_or_else(|| self.settings.default_category.clone());

        let listing = self
            .provider
            .list_messages(user_id, query, None, Some(limit))
            .await?;
        let mut ids = listing.ids;
        ids.truncate(limit);

        let mut emails = Vec::with_capacity(ids.len());
        for batch in ids.chunks(self.settings.batch_size) {
            let fetched = self.provider.fetch_content_batch(user_id, batch).await?;
            emails.extend(fetched.into_iter().map(|e| e.tagged(category.clone())));
        }
        debug!(user_id = %user_id, count = emails.len(), "preview fetched");
        Ok(emails)
    }

    pub async fn get_job(&self, user_id: UserId, job_id: SyncJobId) -> Result<Option<SyncJob>, SyncError> {
        Ok(self.jobs.get(user_id, job_id).await?)
    }

    pub async fn list_jobs(&self, user_id: UserId, limit: usize) -> Result<Vec<SyncJob>, SyncError> {
        Ok(self.jobs.list_for_user(user_id, limit).await?)
    }
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
