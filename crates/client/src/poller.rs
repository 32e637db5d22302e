//! Client poller: start a sync job and follow it to a terminal state.
//!
//! State machine:
//!
//! ```text
//! Idle -> Starting -> Polling -> Done
//!                  \          \-> Error
//!                   \-> Error
//! ```
//!
//! The next poll is only scheduled after the previous one resolved, so polls
//! never overlap. While polling, the reported progress is the highest
//! percentage seen so far for the job, so it never goes down.
//!
//! Dropping or cancelling a run stops polling; the job itself keeps running on
//! the server.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use finsync_core::{SyncJobId, SyncJobStatus};

use crate::api::{ClientError, JobSnapshot, StartSyncParams, SyncApi};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("could not start sync: {0}")]
    Start(ClientError),
    #[error("could not fetch sync status: {0}")]
    Poll(ClientError),
    #[error("sync failed: {0}")]
    JobFailed(String),
    #[error("poller is already running a job")]
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Starting,
    Polling {
        job: JobSnapshot,
        /// Highest percentage observed for this job.
        progress: u8,
    },
    Done(JobSnapshot),
    Error {
        /// Last snapshot seen, if the job was ever observed.
        job: Option<JobSnapshot>,
        error: PollError,
    },
}

impl PollerState {
    pub fn job(&self) -> Option<&JobSnapshot> {
        match self {
            PollerState::Polling { job, .. } | PollerState::Done(job) => Some(job),
            PollerState::Error { job, .. } => job.as_ref(),
            PollerState::Idle | PollerState::Starting => None,
        }
    }

    pub fn progress_percent(&self) -> u8 {
        match self {
            PollerState::Polling { progress, .. } => *progress,
            other => other.job().map_or(0, JobSnapshot::progress_percent),
        }
    }

    fn polling(job: JobSnapshot, seen: u8) -> Self {
        let progress = job.progress_percent().max(seen);
        PollerState::Polling { job, progress }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, PollerState::Done(_) | PollerState::Error { .. })
    }
}

type CompletedHook = Box<dyn Fn(&JobSnapshot) + Send + Sync>;

pub struct SyncPoller<A> {
    api: A,
    poll_interval: Duration,
    state: watch::Sender<PollerState>,
    on_completed: Option<CompletedHook>,
}

impl<A: SyncApi> SyncPoller<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: watch::Sender::new(PollerState::Idle),
            on_completed: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Called once when a job completes, e.g. to invalidate cached email lists.
    pub fn on_completed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobSnapshot) + Send + Sync + 'static,
    {
        self.on_completed = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> PollerState {
        self.state.borrow().clone()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    /// Request a new job and seed a pending snapshot for it.
    pub async fn start(&mut self, params: &StartSyncParams) -> Result<SyncJobId, PollError> {
        if matches!(*self.state.borrow(), PollerState::Starting | PollerState::Polling { .. }) {
            return Err(PollError::Busy);
        }
        self.set(PollerState::Starting);

        match self.api.start_sync(params).await {
            Ok(job_id) => {
                info!(job_id = %job_id, "sync job started");
                self.set(PollerState::polling(JobSnapshot::pending(job_id), 0));
                Ok(job_id)
            }
            Err(e) => {
                let error = PollError::Start(e);
                self.set(PollerState::Error {
                    job: None,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Fetch the job's status once and apply the transition.
    ///
    /// Does nothing unless the poller is `Polling`.
    pub async fn poll_once(&mut self) -> PollerState {
        let Some((job_id, seen)) = (match &*self.state.borrow() {
            PollerState::Polling { job, progress } => Some((job.id, *progress)),
            _ => None,
        }) else {
            return self.state();
        };

        let next = match self.api.job_status(job_id).await {
            Ok(job) => match job.status {
                SyncJobStatus::Pending | SyncJobStatus::Running => {
                    let next = PollerState::polling(job, seen);
                    debug!(job_id = %job_id, progress = next.progress_percent(), "sync job in progress");
                    next
                }
                SyncJobStatus::Completed => {
                    info!(job_id = %job_id, new_emails = job.new_emails, "sync job completed");
                    if let Some(hook) = &self.on_completed {
                        hook(&job);
                    }
                    PollerState::Done(job)
                }
                SyncJobStatus::Failed => {
                    let message = job
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "sync failed".to_string());
                    warn!(job_id = %job_id, error = %message, "sync job failed");
                    PollerState::Error {
                        job: Some(job),
                        error: PollError::JobFailed(message),
                    }
                }
            },
            Err(e) => {
                // The job may still be running; only this poller stops.
                warn!(job_id = %job_id, error = %e, "sync status poll failed");
                PollerState::Error {
                    job: self.state.borrow().job().cloned(),
                    error: PollError::Poll(e),
                }
            }
        };

        self.set(next.clone());
        next
    }

    /// Start a job and poll it until it completes or fails.
    pub async fn run(&mut self, params: &StartSyncParams) -> Result<JobSnapshot, PollError> {
        self.start(params).await?;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.poll_once().await {
                PollerState::Done(job) => return Ok(job),
                PollerState::Error { error, .. } => return Err(error),
                _ => {}
            }
        }
    }

    /// Like [`run`](Self::run), but stops polling when `cancel` resolves.
    ///
    /// Returns `None` when cancelled; the state is left as last observed.
    pub async fn run_until<F>(
        &mut self,
        params: &StartSyncParams,
        cancel: F,
    ) -> Option<Result<JobSnapshot, PollError>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                debug!("sync poller cancelled");
                None
            }
            result = self.run(params) => Some(result),
        }
    }

    fn set(&self, state: PollerState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    /// Returns scripted status responses in order; the last one repeats.
    struct ScriptedApi {
        job_id: SyncJobId,
        start: Result<(), ClientError>,
        responses: Mutex<VecDeque<Result<JobSnapshot, ClientError>>>,
        polls: Arc<AtomicUsize>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<JobSnapshot, ClientError>>) -> Self {
            Self {
                job_id: SyncJobId::new(),
                start: Ok(()),
                responses: Mutex::new(responses.into()),
                polls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl SyncApi for ScriptedApi {
        async fn start_sync(&self, _: &StartSyncParams) -> Result<SyncJobId, ClientError> {
            self.start.clone().map(|_| self.job_id)
        }

        async fn job_status(&self, job_id: SyncJobId) -> Result<JobSnapshot, ClientError> {
            assert_eq!(job_id, self.job_id);
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 {
                responses.pop_front()
            } else {
                responses.front().cloned()
            };
            next.expect("script exhausted").map(|mut job| {
                job.id = job_id;
                job
            })
        }
    }

    fn snapshot(status: SyncJobStatus, processed: u32, total: Option<u32>) -> JobSnapshot {
        JobSnapshot {
            id: SyncJobId::new(),
            status,
            total_emails: total,
            processed_emails: processed,
            new_emails: processed,
            error_message: None,
        }
    }

    fn pending() -> JobSnapshot {
        snapshot(SyncJobStatus::Pending, 0, None)
    }

    fn running(processed: u32, total: u32) -> JobSnapshot {
        snapshot(SyncJobStatus::Running, processed, Some(total))
    }

    fn completed(total: u32) -> JobSnapshot {
        snapshot(SyncJobStatus::Completed, total, Some(total))
    }

    #[tokio::test]
    async fn progress_follows_each_poll() {
        let mut poller = SyncPoller::new(ScriptedApi::new(vec![
            Ok(pending()),
            Ok(running(2, 5)),
            Ok(completed(5)),
        ]));
        assert_eq!(poller.state(), PollerState::Idle);

        let job_id = poller.start(&StartSyncParams::query("from:bank")).await.unwrap();
        assert_eq!(
            poller.state(),
            PollerState::Polling {
                job: JobSnapshot::pending(job_id),
                progress: 0,
            }
        );

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(poller.poll_once().await.progress_percent());
        }
        assert_eq!(seen, vec![0, 40, 100]);
        assert!(matches!(poller.state(), PollerState::Done(_)));

        // Finished pollers do not poll again.
        let polls_before = poller.api.polls.load(Ordering::SeqCst);
        poller.poll_once().await;
        assert_eq!(poller.api.polls.load(Ordering::SeqCst), polls_before);
    }

    #[tokio::test]
    async fn progress_does_not_drop_when_the_total_becomes_known() {
        let mut poller = SyncPoller::new(ScriptedApi::new(vec![
            Ok(pending()),
            Ok(snapshot(SyncJobStatus::Running, 0, None)),
            Ok(running(0, 5)),
            Ok(running(2, 5)),
            Ok(completed(5)),
        ]));
        poller.start(&StartSyncParams::default()).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(poller.poll_once().await.progress_percent());
        }
        assert_eq!(seen, vec![0, 10, 10, 40, 100]);

        // The snapshot itself is kept as reported.
        assert_eq!(poller.state().job().map(|j| j.total_emails), Some(Some(5)));
    }

    #[tokio::test]
    async fn unknown_total_shows_indeterminate_progress() {
        let mut poller = SyncPoller::new(ScriptedApi::new(vec![Ok(snapshot(
            SyncJobStatus::Running,
            0,
            None,
        ))]));
        poller.start(&StartSyncParams::default()).await.unwrap();
        assert_eq!(poller.poll_once().await.progress_percent(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_on_the_interval_and_fires_the_completed_hook() {
        let api = ScriptedApi::new(vec![Ok(running(1, 4)), Ok(running(4, 4)), Ok(completed(4))]);
        let polls = api.polls.clone();
        let completions = Arc::new(AtomicUsize::new(0));
        let hook_count = completions.clone();

        let mut poller = SyncPoller::new(api).on_completed(move |_| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });
        let mut states = poller.subscribe();

        let started = tokio::time::Instant::now();
        let job = poller.run(&StartSyncParams::default()).await.unwrap();

        assert_eq!(job.status, SyncJobStatus::Completed);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= DEFAULT_POLL_INTERVAL * 3);
        assert_eq!(states.borrow_and_update().progress_percent(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn running_at_total_stays_below_100() {
        let mut poller = SyncPoller::new(ScriptedApi::new(vec![Ok(running(4, 4))]));
        poller.start(&StartSyncParams::default()).await.unwrap();
        assert_eq!(poller.poll_once().await.progress_percent(), 99);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_surfaces_its_error_message() {
        let mut failed = snapshot(SyncJobStatus::Failed, 0, None);
        failed.error_message = Some("Mail provider authorization expired".into());
        let mut poller = SyncPoller::new(ScriptedApi::new(vec![Ok(pending()), Ok(failed)]));

        let err = poller.run(&StartSyncParams::default()).await.unwrap_err();
        assert_eq!(
            err,
            PollError::JobFailed("Mail provider authorization expired".into())
        );
        assert!(poller.state().is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_stop_polling() {
        let api = ScriptedApi::new(vec![
            Ok(running(1, 5)),
            Err(ClientError::Network("connection reset".into())),
        ]);
        let polls = api.polls.clone();
        let mut poller = SyncPoller::new(api);

        let err = poller.run(&StartSyncParams::default()).await.unwrap_err();
        assert!(matches!(err, PollError::Poll(ClientError::Network(_))));
        assert_eq!(polls.load(Ordering::SeqCst), 2);

        // The last good snapshot is kept for display.
        assert_eq!(poller.state().progress_percent(), 20);
    }

    #[tokio::test]
    async fn start_failures_are_reported() {
        let mut api = ScriptedApi::new(vec![Ok(pending())]);
        api.start = Err(ClientError::SyncInProgress { job_id: None });
        let mut poller = SyncPoller::new(api);

        let err = poller.start(&StartSyncParams::default()).await.unwrap_err();
        assert_eq!(err, PollError::Start(ClientError::SyncInProgress { job_id: None }));
        assert_eq!(poller.state().job(), None);
        assert!(poller.state().is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_stops_polling() {
        let api = ScriptedApi::new(vec![Ok(running(1, 5))]);
        let polls = api.polls.clone();
        let mut poller = SyncPoller::new(api);

        let cancel = tokio::time::sleep(Duration::from_millis(2500));
        let outcome = poller.run_until(&StartSyncParams::default(), cancel).await;

        assert!(outcome.is_none());
        assert_eq!(polls.load(Ordering::SeqCst), 2);
        assert!(matches!(poller.state(), PollerState::Polling { .. }));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }
}
