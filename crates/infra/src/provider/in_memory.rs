//! In-memory mailbox for tests/dev.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use finsync_core::{RawEmail, UserId};

use super::{EmailProvider, MessageListing, ProviderError};

#[derive(Debug, Default)]
struct Mailbox {
    /// Oldest first; the cursor is an index into this list.
    messages: Vec<RawEmail>,
    list_failure: Option<ProviderError>,
    fetch_failure: Option<ProviderError>,
}

/// Deterministic mailbox keyed by user.
///
/// Queries are matched naively: every bare term must appear (case-insensitive)
/// in the subject, sender or text; `key:value` operators are ignored. Cursors
/// are positions in the mailbox, so a run only sees messages delivered after
/// the cursor it resumed from.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMailbox {
    inner: Arc<RwLock<HashMap<UserId, Mailbox>>>,
    fetch_calls: Arc<std::sync::atomic::AtomicUsize>,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message to a user's mailbox.
    pub async fn deliver(&self, user_id: UserId, email: RawEmail) {
        self.inner
            .write()
            .await
            .entry(user_id)
            .or_default()
            .messages
            .push(email);
    }

    /// Make every listing call for the user fail.
    pub async fn fail_listing(&self, user_id: UserId, error: ProviderError) {
        self.inner.write().await.entry(user_id).or_default().list_failure = Some(error);
    }

    /// Make every content fetch for the user fail.
    pub async fn fail_fetching(&self, user_id: UserId, error: ProviderError) {
        self.inner.write().await.entry(user_id).or_default().fetch_failure = Some(error);
    }

    /// Number of content fetch requests served (a batch counts once).
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn matches(email: &RawEmail, query: Option<&str>) -> bool {
        let Some(query) = query else {
            return true;
        };
        let haystack = [
            email.subject.as_deref(),
            email.from.as_deref(),
            email.text(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

        query
            .split_whitespace()
            .filter(|term| !term.contains(':'))
            .all(|term| haystack.contains(&term.to_lowercase()))
    }
}

#[async_trait]
impl EmailProvider for InMemoryMailbox {
    async fn list_messages(
        &self,
        user_id: UserId,
        query: Option<&str>,
        cursor: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<MessageListing, ProviderError> {
        let inner = self.inner.read().await;
        let Some(mailbox) = inner.get(&user_id) else {
            return Ok(MessageListing::default());
        };
        if let Some(err) = &mailbox.list_failure {
            return Err(err.clone());
        }

        let start = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| ProviderError::Decode(format!("invalid cursor: {c}")))?,
            None => 0,
        };
        let start = start.min(mailbox.messages.len());

        // Newest first, like a real provider.
        let mut ids: Vec<String> = mailbox.messages[start..]
            .iter()
            .rev()
            .filter(|m| Self::matches(m, query))
            .map(|m| m.provider_message_id.clone())
            .collect();
        if let Some(max) = max_results {
            ids.truncate(max);
        }

        Ok(MessageListing {
            ids,
            next_cursor: Some(mailbox.messages.len().to_string()),
        })
    }

    async fn fetch_content(&self, user_id: UserId, id: &str) -> Result<RawEmail, ProviderError> {
        self.fetch_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let inner = self.inner.read().await;
        let mailbox = inner
            .get(&user_id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        if let Some(err) = &mailbox.fetch_failure {
            return Err(err.clone());
        }
        mailbox
            .messages
            .iter()
            .find(|m| m.provider_message_id == id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn fetch_content_batch(
        &self,
        user_id: UserId,
        ids: &[String],
    ) -> Result<Vec<RawEmail>, ProviderError> {
        self.fetch_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let inner = self.inner.read().await;
        let Some(mailbox) = inner.get(&user_id) else {
            return Ok(Vec::new());
        };
        if let Some(err) = &mailbox.fetch_failure {
            return Err(err.clone());
        }
        // Ids that vanished between listing and fetching are skipped.
        Ok(ids
            .iter()
            .filter_map(|id| {
                mailbox
                    .messages
                    .iter()
                    .find(|m| &m.provider_message_id == id)
                    .cloned()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsync_core::EmailCategory;

    fn email(id: &str, subject: &str) -> RawEmail {
        RawEmail::new(id, EmailCategory::expenses()).with_subject(subject)
    }

    #[tokio::test]
    async fn lists_matching_ids_newest_first() {
        let mailbox = InMemoryMailbox::new();
        let user = UserId::new();
        mailbox.deliver(user, email("m1", "Your statement is ready")).await;
        mailbox.deliver(user, email("m2", "Lunch plans")).await;
        mailbox.deliver(user, email("m3", "Card statement")).await;

        let listing = mailbox
            .list_messages(user, Some("subject:(statement) statement newer_than:30d"), None, None)
            .await
            .unwrap();

        assert_eq!(listing.ids, vec!["m3", "m1"]);
        assert_eq!(listing.next_cursor.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn cursor_skips_already_listed_messages() {
        let mailbox = InMemoryMailbox::new();
        let user = UserId::new();
        mailbox.deliver(user, email("m1", "a")).await;
        mailbox.deliver(user, email("m2", "b")).await;

        let first = mailbox.list_messages(user, None, None, None).await.unwrap();
        mailbox.deliver(user, email("m3", "c")).await;
        let second = mailbox
            .list_messages(user, None, first.next_cursor.as_deref(), None)
            .await
            .unwrap();

        assert_eq!(second.ids, vec!["m3"]);
    }

    #[tokio::test]
    async fn mailboxes_are_isolated_per_user() {
        let mailbox = InMemoryMailbox::new();
        let alice = UserId::new();
        let bob = UserId::new();
        mailbox.deliver(alice, email("m1", "a")).await;

        assert!(mailbox.list_messages(bob, None, None, None).await.unwrap().ids.is_empty());
        assert!(matches!(
            mailbox.fetch_content(bob, "m1").await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let mailbox = InMemoryMailbox::new();
        let user = UserId::new();
        mailbox.fail_listing(user, ProviderError::AuthExpired).await;

        assert_eq!(
            mailbox.list_messages(user, None, None, None).await,
            Err(ProviderError::AuthExpired)
        );
    }

    #[tokio::test]
    async fn batch_fetch_counts_as_one_request() {
        let mailbox = InMemoryMailbox::new();
        let user = UserId::new();
        mailbox.deliver(user, email("m1", "a")).await;
        mailbox.deliver(user, email("m2", "b")).await;

        let emails = mailbox
            .fetch_content_batch(user, &["m1".to_string(), "m2".to_string()])
            .await
            .unwrap();

        assert_eq!(emails.len(), 2);
        assert_eq!(mailbox.fetch_calls(), 1);
    }
}
