//! Sync job repository.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use finsync_core::{SyncJob, SyncJobId, UserId};

/// Sync job repository abstraction.
///
/// Every write persists the whole job record at once, so concurrent readers
/// only ever observe complete snapshots.
#[async_trait]
pub trait SyncJobRepository: Send + Sync {
    /// Insert a new job.
    ///
    /// Fails with `ActiveJobExists` while another pending/running job exists
    /// for the same user.
    async fn insert(&self, job: &SyncJob) -> Result<(), RepositoryError>;

    /// Get a job by ID, scoped to its owner.
    async fn get(&self, user_id: UserId, job_id: SyncJobId) -> Result<Option<SyncJob>, RepositoryError>;

    /// Replace a stored job with `job`.
    ///
    /// Fails with `AlreadyTerminal` if the stored copy has already finished.
    async fn save(&self, job: &SyncJob) -> Result<(), RepositoryError>;

    /// Mark an active job failed in place, keeping its stored counters.
    ///
    /// With `not_updated_since`, only a job last updated before that instant is
    /// failed. Returns `false` when the job already finished or was updated
    /// more recently.
    async fn fail_active(
        &self,
        user_id: UserId,
        job_id: SyncJobId,
        message: &str,
        not_updated_since: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError>;

    /// The user's pending/running job, if any.
    async fn find_active(&self, user_id: UserId) -> Result<Option<SyncJob>, RepositoryError>;

    /// A user's jobs, newest first.
    async fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<SyncJob>, RepositoryError>;

    /// Active jobs (any user) not updated since `cutoff`.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<SyncJob>, RepositoryError>;
}

/// Sync job repository error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("sync job not found: {0}")]
    NotFound(SyncJobId),
    #[error("user isolation violation")]
    UserIsolation,
    #[error("sync job already exists: {0}")]
    AlreadyExists(SyncJobId),
    #[error("a sync is already in progress: {0}")]
    ActiveJobExists(SyncJobId),
    #[error("sync job already finished: {0}")]
    AlreadyTerminal(SyncJobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory sync job repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySyncJobRepository {
    jobs: RwLock<HashMap<SyncJobId, SyncJob>>,
}

impl InMemorySyncJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SyncJobRepository for InMemorySyncJobRepository {
    async fn insert(&self, job: &SyncJob) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(RepositoryError::AlreadyExists(job.id));
        }
        // Checked under the write lock, so two inserts cannot both pass.
        if job.is_active() {
            if let Some(active) = jobs
                .values()
                .find(|j| j.user_id == job.user_id && j.is_active())
            {
                return Err(RepositoryError::ActiveJobExists(active.id));
            }
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, user_id: UserId, job_id: SyncJobId) -> Result<Option<SyncJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        match jobs.get(&job_id) {
            Some(job) if job.user_id == user_id => Ok(Some(job.clone())),
            Some(_) => Err(RepositoryError::UserIsolation),
            None => Ok(None),
        }
    }

    async fn save(&self, job: &SyncJob) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get(&job.id).ok_or(RepositoryError::NotFound(job.id))?;
        if stored.user_id != job.user_id {
            return Err(RepositoryError::UserIsolation);
        }
        if stored.is_terminal() {
            return Err(RepositoryError::AlreadyTerminal(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn fail_active(
        &self,
        user_id: UserId,
        job_id: SyncJobId,
        message: &str,
        not_updated_since: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&job_id).ok_or(RepositoryError::NotFound(job_id))?;
        if stored.user_id != user_id {
            return Err(RepositoryError::UserIsolation);
        }
        if stored.is_terminal() || not_updated_since.is_some_and(|cutoff| stored.updated_at >= cutoff) {
            return Ok(false);
        }
        stored
            .mark_failed(message)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(true)
    }

    async fn find_active(&self, user_id: UserId) -> Result<Option<SyncJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .find(|j| j.user_id == user_id && j.is_active())
            .cloned())
    }

    async fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<SyncJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<SyncJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.is_active() && j.updated_at < cutoff)
            .cloned()
            .collect();

        result.sort_by_key(|j| j.updated_at);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsync_core::SyncJobStatus;

    fn new_job(user: UserId) -> SyncJob {
        SyncJob::new(user, Some("from:bank".into()), None).unwrap()
    }

    #[tokio::test]
    async fn insert_and_get() {
        let repo = InMemorySyncJobRepository::new();
        let user = UserId::new();
        let job = new_job(user);
        repo.insert(&job).await.unwrap();

        let loaded = repo.get(user, job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(repo.get(user, SyncJobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_isolation() {
        let repo = InMemorySyncJobRepository::new();
        let alice = UserId::new();
        let bob = UserId::new();
        let job = new_job(alice);
        repo.insert(&job).await.unwrap();

        assert_eq!(repo.get(bob, job.id).await, Err(RepositoryError::UserIsolation));

        let mut forged = job.clone();
        forged.user_id = bob;
        assert_eq!(repo.save(&forged).await, Err(RepositoryError::UserIsolation));
    }

    #[tokio::test]
    async fn single_flight_per_user() {
        let repo = InMemorySyncJobRepository::new();
        let user = UserId::new();
        let first = new_job(user);
        repo.insert(&first).await.unwrap();

        let second = new_job(user);
        assert_eq!(
            repo.insert(&second).await,
            Err(RepositoryError::ActiveJobExists(first.id))
        );

        // Another user is unaffected.
        repo.insert(&new_job(UserId::new())).await.unwrap();

        // Once the first job finishes, a new one may start.
        let mut done = first.clone();
        done.mark_failed("boom").unwrap();
        repo.save(&done).await.unwrap();
        repo.insert(&second).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let repo = InMemorySyncJobRepository::new();
        let user = UserId::new();
        let mut job = new_job(user);
        repo.insert(&job).await.unwrap();

        job.mark_running().unwrap();
        repo.save(&job).await.unwrap();
        let stale_copy = job.clone();

        job.mark_failed("timed out").unwrap();
        repo.save(&job).await.unwrap();

        assert_eq!(
            repo.save(&stale_copy).await,
            Err(RepositoryError::AlreadyTerminal(job.id))
        );
        let stored = repo.get(user, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncJobStatus::Failed);
    }

    #[tokio::test]
    async fn fail_active_keeps_the_latest_counters() {
        let repo = InMemorySyncJobRepository::new();
        let user = UserId::new();
        let mut job = new_job(user);
        repo.insert(&job).await.unwrap();
        job.mark_running().unwrap();
        job.set_total(5).unwrap();
        repo.save(&job).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(1);

        // The worker makes progress after another task read its copy.
        for _ in 0..3 {
            job.record_processed(true).unwrap();
        }
        repo.save(&job).await.unwrap();

        assert!(repo.fail_active(user, job.id, "sync timed out", Some(cutoff)).await.unwrap());
        let stored = repo.get(user, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncJobStatus::Failed);
        assert_eq!(stored.processed_emails, 3);
        assert_eq!(stored.new_emails, 3);
        assert_eq!(stored.error_message.as_deref(), Some("sync timed out"));

        // Already finished: nothing to do.
        assert!(!repo.fail_active(user, job.id, "again", None).await.unwrap());
        assert_eq!(
            repo.fail_active(UserId::new(), job.id, "x", None).await,
            Err(RepositoryError::UserIsolation)
        );
    }

    #[tokio::test]
    async fn fail_active_skips_recently_updated_jobs() {
        let repo = InMemorySyncJobRepository::new();
        let user = UserId::new();
        let job = new_job(user);
        repo.insert(&job).await.unwrap();

        let cutoff = job.updated_at - chrono::Duration::seconds(1);
        assert!(!repo.fail_active(user, job.id, "sync timed out", Some(cutoff)).await.unwrap());
        assert!(repo.find_active(user).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn save_requires_existing_job() {
        let repo = InMemorySyncJobRepository::new();
        let job = new_job(UserId::new());
        assert_eq!(repo.save(&job).await, Err(RepositoryError::NotFound(job.id)));
    }

    #[tokio::test]
    async fn lists_newest_first_with_limit() {
        let repo = InMemorySyncJobRepository::new();
        let user = UserId::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut job = new_job(user);
            repo.insert(&job).await.unwrap();
            job.mark_failed("x").unwrap();
            repo.save(&job).await.unwrap();
            ids.push(job.id);
        }

        let listed = repo.list_for_user(user, 2).await.unwrap();
        assert_eq!(listed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);
    }

    #[tokio::test]
    async fn stale_listing_only_returns_active_jobs() {
        let repo = InMemorySyncJobRepository::new();
        let active = new_job(UserId::new());
        repo.insert(&active).await.unwrap();

        let mut finished = new_job(UserId::new());
        repo.insert(&finished).await.unwrap();
        finished.mark_failed("x").unwrap();
        repo.save(&finished).await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let stale = repo.list_stale(cutoff).await.unwrap();
        assert_eq!(stale.iter().map(|j| j.id).collect::<Vec<_>>(), vec![active.id]);
    }
}
