//! In-memory raw email store for tests/dev.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use finsync_core::{EmailCategory, RawEmail, StoredEmail, UserId};

use super::{RawEmailStore, StoreError, UpsertOutcome};

#[derive(Debug, Default)]
pub struct InMemoryRawEmailStore {
    emails: RwLock<HashMap<(UserId, String), StoredEmail>>,
}

impl InMemoryRawEmailStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RawEmailStore for InMemoryRawEmailStore {
    async fn upsert(&self, user_id: UserId, email: RawEmail) -> Result<UpsertOutcome, StoreError> {
        let mut emails = self.emails.write().await;
        let key = (user_id, email.provider_message_id.clone());
        match emails.get_mut(&key) {
            Some(existing) => {
                let category = existing.email.category.clone();
                existing.email = email.tagged(category);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                emails.insert(
                    key,
                    StoredEmail {
                        user_id,
                        email,
                        stored_at: Utc::now(),
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn list(
        &self,
        user_id: UserId,
        category: Option<&EmailCategory>,
    ) -> Result<Vec<StoredEmail>, StoreError> {
        let emails = self.emails.read().await;
        let mut result: Vec<_> = emails
            .values()
            .filter(|e| e.user_id == user_id && category.is_none_or(|c| &e.email.category == c))
            .cloned()
            .collect();

        result.sort_by(|a, b| {
            a.stored_at
                .cmp(&b.stored_at)
                .then_with(|| a.email.provider_message_id.cmp(&b.email.provider_message_id))
        });
        Ok(result)
    }

    async fn count(&self, user_id: UserId) -> Result<usize, StoreError> {
        let emails = self.emails.read().await;
        Ok(emails.keys().filter(|(u, _)| *u == user_id).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_idempotent_per_provider_id() {
        let store = InMemoryRawEmailStore::new();
        let user = UserId::new();
        let email = RawEmail::new("m1", EmailCategory::expenses());

        assert_eq!(store.upsert(user, email.clone()).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(user, email).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.count(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_message_id_is_distinct_across_users() {
        let store = InMemoryRawEmailStore::new();
        let email = RawEmail::new("m1", EmailCategory::expenses());

        assert!(store.upsert(UserId::new(), email.clone()).await.unwrap().is_new());
        assert!(store.upsert(UserId::new(), email).await.unwrap().is_new());
    }

    #[tokio::test]
    async fn update_keeps_first_category_and_stored_at() {
        let store = InMemoryRawEmailStore::new();
        let user = UserId::new();
        store
            .upsert(user, RawEmail::new("m1", EmailCategory::playground()))
            .await
            .unwrap();
        let first = store.list(user, None).await.unwrap()[0].stored_at;

        store
            .upsert(user, RawEmail::new("m1", EmailCategory::expenses()))
            .await
            .unwrap();

        let playground = store.list(user, Some(&EmailCategory::playground())).await.unwrap();
        assert_eq!(playground.len(), 1);
        assert_eq!(playground[0].stored_at, first);
        assert_eq!(playground[0].email.category, EmailCategory::playground());
        assert!(
            store
                .list(user, Some(&EmailCategory::expenses()))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
