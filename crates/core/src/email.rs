//! Raw email payloads and the category tags they are fetched under.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::UserId;

/// Label distinguishing why a raw email was fetched.
///
/// Several features share the ingestion pipeline (expense tracking, ad-hoc
/// exploration), so every stored email carries the tag of the run that
/// fetched it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmailCategory(String);

impl EmailCategory {
    pub const MAX_LEN: usize = 64;

    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err(DomainError::validation("category must not be empty"));
        }
        if value.len() > Self::MAX_LEN {
            return Err(DomainError::validation(format!(
                "category must be at most {} characters",
                Self::MAX_LEN
            )));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DomainError::validation(
                "category may only contain letters, digits, '-' and '_'",
            ));
        }
        Ok(Self(value))
    }

    pub fn expenses() -> Self {
        Self("expenses".to_string())
    }

    pub fn playground() -> Self {
        Self("playground".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EmailCategory {
    fn default() -> Self {
        Self::expenses()
    }
}

impl core::fmt::Display for EmailCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for EmailCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Unparsed provider message content plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEmail {
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub category: EmailCategory,
}

impl RawEmail {
    /// Minimal email with only an id; the rest is filled in by builders or the gateway.
    pub fn new(provider_message_id: impl Into<String>, category: EmailCategory) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            thread_id: None,
            subject: None,
            from: None,
            to: None,
            date: None,
            snippet: None,
            body_text: None,
            body_html: None,
            label_ids: Vec::new(),
            category,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_body_text(mut self, body: impl Into<String>) -> Self {
        self.body_text = Some(body.into());
        self
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Re-tag the email for the run that fetched it.
    pub fn tagged(mut self, category: EmailCategory) -> Self {
        self.category = category;
        self
    }

    /// Best-effort plain text: the text part, else the snippet.
    pub fn text(&self) -> Option<&str> {
        self.body_text
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(self.snippet.as_deref())
    }
}

/// A raw email persisted for a user, unique on `(user_id, provider_message_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEmail {
    pub user_id: UserId,
    #[serde(flatten)]
    pub email: RawEmail,
    pub stored_at: DateTime<Utc>,
}
