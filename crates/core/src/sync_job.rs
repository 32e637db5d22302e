//! Sync job record: the lifecycle of one email ingestion run.
//!
//! A job is created `pending`, moves to `running` when work starts, and ends
//! in exactly one of `completed` or `failed`. Terminal jobs are immutable.
//! All mutators return `DomainError::InvariantViolation` instead of silently
//! breaking an invariant.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::email::EmailCategory;
use crate::error::{DomainError, DomainResult};
use crate::id::{SyncJobId, UserId};
use crate::progress;

/// Longest provider query accepted for a run.
pub const MAX_QUERY_LEN: usize = 512;

/// Sync job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    /// Created, work not started yet
    Pending,
    /// Listing/fetching/parsing in progress
    Running,
    /// Finished without a fatal error
    Completed,
    /// Finished with a fatal error (see `error_message`)
    Failed,
}

impl SyncJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncJobStatus::Completed | SyncJobStatus::Failed)
    }

    /// Pending or running: counts against the per-user single-flight limit.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobStatus::Pending => "pending",
            SyncJobStatus::Running => "running",
            SyncJobStatus::Completed => "completed",
            SyncJobStatus::Failed => "failed",
        }
    }

    fn can_transition_to(&self, next: SyncJobStatus) -> bool {
        use SyncJobStatus::*;
        matches!(
            (*self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }
}

impl core::fmt::Display for SyncJobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SyncJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncJobStatus::Pending),
            "running" => Ok(SyncJobStatus::Running),
            "completed" => Ok(SyncJobStatus::Completed),
            "failed" => Ok(SyncJobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// What a job does with its candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncJobKind {
    /// List and fetch from the mail provider, then store (and parse).
    Sync,
    /// Re-parse emails already in the raw email store; no provider calls.
    Reprocess,
}

impl SyncJobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobKind::Sync => "sync",
            SyncJobKind::Reprocess => "reprocess",
        }
    }
}

impl core::fmt::Display for SyncJobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SyncJobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(SyncJobKind::Sync),
            "reprocess" => Ok(SyncJobKind::Reprocess),
            other => Err(DomainError::validation(format!("unknown job kind: {other}"))),
        }
    }
}

/// One ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: SyncJobId,
    pub user_id: UserId,
    pub kind: SyncJobKind,
    pub category: EmailCategory,
    pub status: SyncJobStatus,
    /// Provider search string; immutable once set.
    pub query: Option<String>,
    /// Cursor the run resumed from.
    pub cursor: Option<String>,
    /// High-water mark to resume the next run from.
    pub next_cursor: Option<String>,
    pub total_emails: Option<u32>,
    pub processed_emails: u32,
    pub new_emails: u32,
    pub transactions: u32,
    pub statements: u32,
    pub parse_failures: u32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    /// Create a pending provider sync.
    pub fn new(user_id: UserId, query: Option<String>, cursor: Option<String>) -> DomainResult<Self> {
        let query = match query {
            Some(q) => Some(validate_query(q)?),
            None => None,
        };
        Ok(Self::pending(user_id, SyncJobKind::Sync, query, cursor))
    }

    /// Create a pending reprocess of already stored emails.
    pub fn reprocess(user_id: UserId, category: EmailCategory) -> Self {
        Self::pending(user_id, SyncJobKind::Reprocess, None, None).with_category(category)
    }

    fn pending(
        user_id: UserId,
        kind: SyncJobKind,
        query: Option<String>,
        cursor: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SyncJobId::new(),
            user_id,
            kind,
            category: EmailCategory::default(),
            status: SyncJobStatus::Pending,
            query,
            cursor,
            next_cursor: None,
            total_emails: None,
            processed_emails: 0,
            new_emails: 0,
            transactions: 0,
            statements: 0,
            parse_failures: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Tag stored emails with a different category (only before the run starts).
    pub fn with_category(mut self, category: EmailCategory) -> Self {
        self.category = category;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Active job whose last update is older than `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.is_active() && now - self.updated_at > stale_after
    }

    /// Progress percentage as shown to pollers.
    pub fn progress_percent(&self) -> u8 {
        progress::progress_percent(self.status, self.processed_emails, self.total_emails)
    }

    /// Mark job as running.
    pub fn mark_running(&mut self) -> DomainResult<()> {
        self.transition(SyncJobStatus::Running)?;
        self.started_at = Some(self.updated_at);
        Ok(())
    }

    /// Record how many candidates the run will process. Set once.
    pub fn set_total(&mut self, total: u32) -> DomainResult<()> {
        self.ensure_running("set total")?;
        if self.total_emails.is_some() {
            return Err(DomainError::invariant("total_emails is already set"));
        }
        self.total_emails = Some(total);
        self.touch();
        Ok(())
    }

    /// Count one stored (or reprocessed) email.
    pub fn record_processed(&mut self, is_new: bool) -> DomainResult<()> {
        self.ensure_running("record processed email")?;
        let total = self
            .total_emails
            .ok_or_else(|| DomainError::invariant("total_emails must be known before processing"))?;
        if self.processed_emails >= total {
            return Err(DomainError::invariant(format!(
                "processed_emails would exceed total_emails ({total})"
            )));
        }
        self.processed_emails += 1;
        if is_new {
            self.new_emails += 1;
        }
        self.touch();
        Ok(())
    }

    pub fn record_transaction(&mut self) -> DomainResult<()> {
        self.ensure_running("record transaction")?;
        self.transactions += 1;
        self.touch();
        Ok(())
    }

    pub fn record_statement(&mut self) -> DomainResult<()> {
        self.ensure_running("record statement")?;
        self.statements += 1;
        self.touch();
        Ok(())
    }

    pub fn record_parse_failure(&mut self) -> DomainResult<()> {
        self.ensure_running("record parse failure")?;
        self.parse_failures += 1;
        self.touch();
        Ok(())
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, next_cursor: Option<String>) -> DomainResult<()> {
        self.transition(SyncJobStatus::Completed)?;
        self.next_cursor = next_cursor;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Mark job as failed. An empty message is replaced so `error_message` is never blank.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.transition(SyncJobStatus::Failed)?;
        self.error_message = Some(failure_message(error));
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    fn transition(&mut self, next: SyncJobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "illegal status transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    fn ensure_running(&self, action: &str) -> DomainResult<()> {
        if self.status != SyncJobStatus::Running {
            return Err(DomainError::invariant(format!(
                "cannot {action} while job is {}",
                self.status
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        // Keep updated_at monotonic even if the wall clock steps back.
        self.updated_at = Utc::now().max(self.updated_at);
    }
}

/// Error message stored on a failed job; never blank.
pub fn failure_message(error: impl Into<String>) -> String {
    let error = error.into();
    if error.trim().is_empty() {
        "sync failed".to_string()
    } else {
        error
    }
}

fn validate_query(query: String) -> DomainResult<String> {
    let trimmed = query.trim();
    if trimmed.chars().count() > MAX_QUERY_LEN {
        return Err(DomainError::validation(format!(
            "query must be at most {MAX_QUERY_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}
