//! Stale job reaper: fails jobs whose worker went away.
//!
//! A job stays `pending`/`running` forever if the process running it dies.
//! Any active job whose `updated_at` is older than `stale_after` is failed
//! with [`TIMED_OUT_MESSAGE`], which also frees the user's single-flight slot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use finsync_core::{SyncJob, UserId};

use super::store::{RepositoryError, SyncJobRepository};

pub const TIMED_OUT_MESSAGE: &str = "sync timed out";

#[derive(Clone)]
pub struct StaleJobReaper {
    jobs: Arc<dyn SyncJobRepository>,
    stale_after: chrono::Duration,
}

impl StaleJobReaper {
    pub fn new(jobs: Arc<dyn SyncJobRepository>, stale_after: Duration) -> Self {
        Self {
            jobs,
            stale_after: chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Fail every stale job. Returns how many were failed.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let Some(cutoff) = self.cutoff(now) else {
            return Ok(0);
        };
        let mut reaped = 0;
        for job in self.jobs.list_stale(cutoff).await? {
            if self.fail(&job, cutoff).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Fail the user's active job if it is stale.
    pub async fn reap_user(&self, user_id: UserId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let Some(cutoff) = self.cutoff(now) else {
            return Ok(false);
        };
        match self.jobs.find_active(user_id).await? {
            Some(job) if job.is_stale(now, self.stale_after) => self.fail(&job, cutoff).await,
            _ => Ok(false),
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.stale_after)
    }

    /// The stored row decides: a job that made progress since it was listed is left alone.
    async fn fail(&self, job: &SyncJob, cutoff: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let failed = self
            .jobs
            .fail_active(job.user_id, job.id, TIMED_OUT_MESSAGE, Some(cutoff))
            .await?;
        if failed {
            warn!(job_id = %job.id, user_id = %job.user_id, "stale sync job failed");
        }
        Ok(failed)
    }

    /// Run [`reap`](Self::reap) every `interval` until shut down.
    pub fn spawn(self, interval: Duration) -> ReaperHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "stale job reaper started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => {
                        info!("stale job reaper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.reap(Utc::now()).await {
                            Ok(0) => debug!("no stale sync jobs"),
                            Ok(n) => info!(reaped = n, "stale sync jobs failed"),
                            Err(e) => error!(error = %e, "stale job sweep failed"),
                        }
                    }
                }
            }
        });

        ReaperHandle { shutdown, join }
    }
}

/// Handle to stop a spawned reaper.
pub struct ReaperHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Request shutdown and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemorySyncJobRepository;
    use finsync_core::SyncJobStatus;

    async fn active_job(repo: &InMemorySyncJobRepository, user: UserId) -> SyncJob {
        let mut job = SyncJob::new(user, None, None).unwrap();
        repo.insert(&job).await.unwrap();
        job.mark_running().unwrap();
        repo.save(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn reaps_only_jobs_past_the_deadline() {
        let repo = InMemorySyncJobRepository::arc();
        let reaper = StaleJobReaper::new(repo.clone(), Duration::from_secs(60));
        let user = UserId::new();
        let job = active_job(&repo, user).await;

        assert_eq!(reaper.reap(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(reaper.reap(later).await.unwrap(), 1);

        let job = repo.get(user, job.id).await.unwrap().unwrap();
        assert_eq!(job.status, SyncJobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(TIMED_OUT_MESSAGE));

        // Nothing left to reap.
        assert_eq!(reaper.reap(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reap_user_frees_the_single_flight_slot() {
        let repo = InMemorySyncJobRepository::arc();
        let reaper = StaleJobReaper::new(repo.clone(), Duration::from_secs(60));
        let user = UserId::new();
        active_job(&repo, user).await;

        assert!(!reaper.reap_user(user, Utc::now()).await.unwrap());
        assert!(repo.find_active(user).await.unwrap().is_some());

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert!(reaper.reap_user(user, later).await.unwrap());
        assert!(repo.find_active(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reaping_keeps_progress_saved_after_the_job_was_listed() {
        let repo = InMemorySyncJobRepository::arc();
        let reaper = StaleJobReaper::new(repo.clone(), Duration::from_secs(60));
        let user = UserId::new();
        let mut job = active_job(&repo, user).await;
        job.set_total(5).unwrap();
        repo.save(&job).await.unwrap();

        // Listed as stale, then the worker saves progress before the reap lands.
        let later = Utc::now() + chrono::Duration::seconds(61);
        let listed = repo.find_active(user).await.unwrap().unwrap();
        for _ in 0..3 {
            job.record_processed(true).unwrap();
        }
        repo.save(&job).await.unwrap();
        assert!(reaper.fail(&listed, later - chrono::Duration::seconds(60)).await.unwrap());

        let stored = repo.get(user, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncJobStatus::Failed);
        assert_eq!(stored.processed_emails, 3);
        assert_eq!(stored.new_emails, 3);
    }

    #[tokio::test]
    async fn jobs_updated_after_the_cutoff_are_not_reaped() {
        let repo = InMemorySyncJobRepository::arc();
        let reaper = StaleJobReaper::new(repo.clone(), Duration::from_secs(60));
        let user = UserId::new();
        let listed = active_job(&repo, user).await;

        let cutoff = listed.updated_at - chrono::Duration::seconds(1);
        assert!(!reaper.fail(&listed, cutoff).await.unwrap());
        assert!(repo.find_active(user).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn spawned_reaper_stops_on_shutdown() {
        let repo = InMemorySyncJobRepository::arc();
        let reaper = StaleJobReaper::new(repo.clone(), Duration::ZERO);
        let user = UserId::new();
        let job = active_job(&repo, user).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let handle = reaper.spawn(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let job = repo.get(user, job.id).await.unwrap().unwrap();
        assert_eq!(job.status, SyncJobStatus::Failed);
    }
}
