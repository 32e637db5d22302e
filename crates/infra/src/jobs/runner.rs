//! Background runner for sync jobs.
//!
//! Each accepted job runs as one tokio task. The runner guarantees a job
//! never stays `running` because its task errored or panicked, and lets the
//! process drain in-flight jobs before exiting.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use finsync_core::{SyncJob, SyncJobId, UserId};

use crate::sync::EmailSyncService;

pub const INTERRUPTED_MESSAGE: &str = "interrupted by shutdown";

pub struct SyncRunner {
    service: Arc<EmailSyncService>,
    tasks: Mutex<JoinSet<()>>,
    in_flight: Arc<RwLock<HashMap<SyncJobId, UserId>>>,
}

impl SyncRunner {
    pub fn new(service: Arc<EmailSyncService>) -> Self {
        Self {
            service,
            tasks: Mutex::new(JoinSet::new()),
            in_flight: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn service(&self) -> &Arc<EmailSyncService> {
        &self.service
    }

    /// Execute a pending job in the background.
    pub async fn spawn(&self, job: SyncJob) {
        let job_id = job.id;
        let user_id = job.user_id;
        let span = info_span!("sync_job", job_id = %job_id, user_id = %user_id, kind = %job.kind);

        self.in_flight.write().await.insert(job_id, user_id);

        let service = self.service.clone();
        let in_flight = self.in_flight.clone();
        let task = async move {
            let outcome = AssertUnwindSafe(service.execute(job)).catch_unwind().await;
            let failure = match outcome {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(format!("sync failed: {e}")),
                Err(panic) => Some(format!("sync failed: {}", panic_message(panic.as_ref()))),
            };

            if let Some(message) = failure {
                error!(error = %message, "sync job aborted");
                if let Err(e) = service.fail_job(user_id, job_id, &message).await {
                    error!(error = %e, "could not record sync job failure");
                }
            }
            in_flight.write().await.remove(&job_id);
        };

        let mut tasks = self.tasks.lock().await;
        // Drop bookkeeping for tasks that already finished.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task.instrument(span));
    }

    /// Number of jobs currently executing.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// Wait up to `grace` for running jobs, then abort the rest and mark them failed.
    ///
    /// Returns how many jobs were interrupted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let mut tasks = self.tasks.lock().await;
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_ok() {
            info!("sync runner drained");
            return 0;
        }

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let leftovers: Vec<_> = self.in_flight.write().await.drain().collect();
        for (job_id, user_id) in &leftovers {
            warn!(job_id = %job_id, user_id = %user_id, "sync job interrupted by shutdown");
            if let Err(e) = self.service.fail_job(*user_id, *job_id, INTERRUPTED_MESSAGE).await {
                error!(job_id = %job_id, error = %e, "could not record sync job interruption");
            }
        }
        leftovers.len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "task panicked"
    }
}
