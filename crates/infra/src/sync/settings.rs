//! Tunables for sync runs.

use std::time::Duration;

use finsync_core::EmailCategory;

/// Hard cap on emails returned by a preview fetch.
pub const PREVIEW_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Most candidates a single run will list from the provider.
    pub max_results: usize,
    /// Emails fetched per `fetch_content_batch` call.
    pub batch_size: usize,
    /// Category applied when a request does not name one.
    pub default_category: EmailCategory,
    /// Active jobs untouched for longer than this are failed by the reaper.
    pub stale_after: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_results: 500,
            batch_size: 25,
            default_category: EmailCategory::expenses(),
            stale_after: Duration::from_secs(15 * 60),
        }
    }
}

impl SyncSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_default_category(mut self, category: EmailCategory) -> Self {
        self.default_category = category;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}
