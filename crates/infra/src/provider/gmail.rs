//! Gmail REST v1 gateway.
//!
//! Incremental listing uses the cursor as a unix timestamp (seconds) and adds
//! an `after:` clause to the query. A listing that enumerated every match
//! returns the time it started as the next cursor; a listing cut short by
//! `max_results` keeps the old cursor so the next run sees the remainder.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use finsync_core::{EmailCategory, RawEmail, UserId};

use super::{EmailProvider, MessageListing, ProviderError};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Gmail caps `maxResults` per page at 500.
const MAX_PAGE_SIZE: usize = 500;

/// Longest error body kept in `ProviderError::Http`.
const ERROR_BODY_MAX_LEN: usize = 200;

/// Supplies OAuth access tokens per user.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, user_id: UserId) -> Result<String, ProviderError>;
}

/// Single pre-issued token used for every user (dev and single-account deployments).
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self, _user_id: UserId) -> Result<String, ProviderError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    messages: Option<Vec<MessageRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    snippet: Option<String>,
    internal_date: Option<String>,
    payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    mime_type: Option<String>,
    #[serde(default)]
    headers: Vec<Header>,
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    data: Option<String>,
}

/// Gmail API gateway.
#[derive(Clone)]
pub struct GmailGateway {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl GmailGateway {
    pub fn new(client: Client, base_url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn get(
        &self,
        user_id: UserId,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<Response, ProviderError> {
        let token = self.tokens.access_token(user_id).await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(params)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        check_status(response).await
    }

    async fn list_page(
        &self,
        user_id: UserId,
        query: Option<&str>,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse, ProviderError> {
        let mut params = vec![("maxResults", page_size.to_string())];
        if let Some(q) = query {
            params.push(("q", q.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let url = format!("{}/users/me/messages", self.base_url);
        self.get(user_id, &url, &params)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl EmailProvider for GmailGateway {
    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn list_messages(
        &self,
        user_id: UserId,
        query: Option<&str>,
        cursor: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<MessageListing, ProviderError> {
        let started_at = Utc::now();
        let query = incremental_query(query, cursor)?;

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        let mut truncated = false;

        loop {
            let remaining = max_results.map(|max| max.saturating_sub(ids.len()));
            if remaining == Some(0) {
                truncated = page_token.is_some();
                break;
            }
            let page_size = remaining.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);

            let page = self
                .list_page(user_id, query.as_deref(), page_size, page_token.as_deref())
                .await?;
            ids.extend(page.messages.unwrap_or_default().into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if let Some(max) = max_results {
            truncated |= ids.len() > max;
            ids.truncate(max);
        }
        debug!(count = ids.len(), truncated, "listed gmail messages");

        let next_cursor = if truncated {
            cursor.map(str::to_string)
        } else {
            Some(started_at.timestamp().to_string())
        };

        Ok(MessageListing { ids, next_cursor })
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn fetch_content(&self, user_id: UserId, id: &str) -> Result<RawEmail, ProviderError> {
        let url = format!("{}/users/me/messages/{}", self.base_url, id);
        let response = self
            .get(user_id, &url, &[("format", "full".to_string())])
            .await
            .map_err(|e| match e {
                ProviderError::Http { status: 404, .. } => ProviderError::NotFound(id.to_string()),
                other => other,
            })?;
        let message: GmailMessage = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(normalize(message))
    }

    async fn fetch_content_batch(
        &self,
        user_id: UserId,
        ids: &[String],
    ) -> Result<Vec<RawEmail>, ProviderError> {
        let results = join_all(ids.iter().map(|id| self.fetch_content(user_id, id))).await;

        let mut emails = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(email) => emails.push(email),
                // Deleted between listing and fetching.
                Err(ProviderError::NotFound(id)) => debug!(%id, "message vanished before fetch"),
                Err(e) => return Err(e),
            }
        }
        Ok(emails)
    }
}

fn incremental_query(query: Option<&str>, cursor: Option<&str>) -> Result<Option<String>, ProviderError> {
    let after = match cursor {
        Some(c) => Some(
            c.parse::<i64>()
                .map_err(|_| ProviderError::Decode(format!("invalid cursor: {c}")))?,
        ),
        None => None,
    };
    let query = query.map(str::trim).filter(|q| !q.is_empty());
    Ok(match (query, after) {
        (Some(q), Some(ts)) => Some(format!("{q} after:{ts}")),
        (Some(q), None) => Some(q.to_string()),
        (None, Some(ts)) => Some(format!("after:{ts}")),
        (None, None) => None,
    })
}

async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::AuthExpired),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            Err(ProviderError::RateLimited { retry_after_secs })
        }
        _ => {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_MAX_LEN {
                let mut end = ERROR_BODY_MAX_LEN;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn normalize(message: GmailMessage) -> RawEmail {
    let mut email = RawEmail::new(message.id, EmailCategory::default());
    email.thread_id = message.thread_id;
    email.label_ids = message.label_ids;
    email.snippet = message.snippet;
    email.date = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    if let Some(payload) = message.payload {
        email.subject = header(&payload, "Subject");
        email.from = header(&payload, "From");
        email.to = header(&payload, "To");
        email.body_text = find_body(&payload, "text/plain");
        email.body_html = find_body(&payload, "text/html");
    }
    email
}

fn header(part: &MessagePart, name: &str) -> Option<String> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Depth-first search for the first part of `mime_type` with decodable data.
fn find_body(part: &MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.as_deref() == Some(mime_type) {
        if let Some(text) = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(decode_base64url)
        {
            return Some(text);
        }
    }
    part.parts.iter().find_map(|p| find_body(p, mime_type))
}

fn decode_base64url(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Path, Query},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::get,
    };
    use std::collections::HashMap;

    const TOKEN: &str = "test-token";

    fn authorized(headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {TOKEN}");
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(expected.as_str())
    }

    async fn list(
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Result<Json<serde_json::Value>, AxumStatus> {
        if !authorized(&headers) {
            return Err(AxumStatus::UNAUTHORIZED);
        }
        if params.get("q").map(String::as_str) == Some("throttle") {
            return Err(AxumStatus::TOO_MANY_REQUESTS);
        }
        // Two pages: m3,m2 then m1.
        let body = match params.get("pageToken").map(String::as_str) {
            None => serde_json::json!({
                "messages": [{"id": "m3", "threadId": "t"}, {"id": "m2", "threadId": "t"}],
                "nextPageToken": "page-2",
            }),
            Some(_) => serde_json::json!({ "messages": [{"id": "m1", "threadId": "t"}] }),
        };
        Ok(Json(body))
    }

    async fn message(
        headers: HeaderMap,
        Path(id): Path<String>,
    ) -> Result<Json<serde_json::Value>, AxumStatus> {
        if !authorized(&headers) {
            return Err(AxumStatus::UNAUTHORIZED);
        }
        if id == "gone" {
            return Err(AxumStatus::NOT_FOUND);
        }
        let text = URL_SAFE_NO_PAD.encode(format!("You spent $12.50 ({id})"));
        let html = URL_SAFE_NO_PAD.encode("<p>You spent $12.50</p>");
        Ok(Json(serde_json::json!({
            "id": id,
            "threadId": "t1",
            "labelIds": ["INBOX"],
            "snippet": "You spent",
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "Subject", "value": "Card alert"},
                    {"name": "From", "value": "alerts@bank.example"},
                ],
                "parts": [
                    {"mimeType": "text/plain", "body": {"data": text}},
                    {"mimeType": "text/html", "body": {"data": html}},
                ],
            },
        })))
    }

    async fn spawn_fake_gmail() -> String {
        let app = Router::new()
            .route("/users/me/messages", get(list))
            .route("/users/me/messages/:id", get(message));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn gateway(base: String, token: &str) -> GmailGateway {
        GmailGateway::new(Client::new(), base, Arc::new(StaticTokenSource::new(token)))
    }

    #[tokio::test]
    async fn lists_across_pages() {
        let gmail = gateway(spawn_fake_gmail().await, TOKEN);
        let listing = gmail
            .list_messages(UserId::new(), Some("from:bank"), None, None)
            .await
            .unwrap();

        assert_eq!(listing.ids, vec!["m3", "m2", "m1"]);
        assert!(listing.next_cursor.is_some());
    }

    #[tokio::test]
    async fn truncated_listing_keeps_previous_cursor() {
        let gmail = gateway(spawn_fake_gmail().await, TOKEN);
        let listing = gmail
            .list_messages(UserId::new(), None, Some("1699990000"), Some(2))
            .await
            .unwrap();

        assert_eq!(listing.ids, vec!["m3", "m2"]);
        assert_eq!(listing.next_cursor.as_deref(), Some("1699990000"));
    }

    #[tokio::test]
    async fn maps_auth_and_rate_limit_errors() {
        let base = spawn_fake_gmail().await;

        let bad = gateway(base.clone(), "wrong");
        assert_eq!(
            bad.list_messages(UserId::new(), None, None, None).await,
            Err(ProviderError::AuthExpired)
        );

        let good = gateway(base, TOKEN);
        assert!(matches!(
            good.list_messages(UserId::new(), Some("throttle"), None, None).await,
            Err(ProviderError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn fetches_and_decodes_message_parts() {
        let gmail = gateway(spawn_fake_gmail().await, TOKEN);
        let email = gmail.fetch_content(UserId::new(), "m1").await.unwrap();

        assert_eq!(email.provider_message_id, "m1");
        assert_eq!(email.subject.as_deref(), Some("Card alert"));
        assert_eq!(email.from.as_deref(), Some("alerts@bank.example"));
        assert_eq!(email.body_text.as_deref(), Some("You spent $12.50 (m1)"));
        assert_eq!(email.body_html.as_deref(), Some("<p>You spent $12.50</p>"));
        assert_eq!(email.date.map(|d| d.timestamp()), Some(1_700_000_000));
        assert_eq!(email.label_ids, vec!["INBOX"]);
    }

    #[tokio::test]
    async fn batch_skips_vanished_messages() {
        let gmail = gateway(spawn_fake_gmail().await, TOKEN);
        let ids = vec!["m1".to_string(), "gone".to_string(), "m2".to_string()];
        let emails = gmail.fetch_content_batch(UserId::new(), &ids).await.unwrap();

        let got: Vec<_> = emails.iter().map(|e| e.provider_message_id.as_str()).collect();
        assert_eq!(got, vec!["m1", "m2"]);
    }

    #[test]
    fn cursor_becomes_after_clause() {
        assert_eq!(
            incremental_query(Some("from:bank"), Some("1700000000")).unwrap(),
            Some("from:bank after:1700000000".to_string())
        );
        assert_eq!(incremental_query(Some("  "), None).unwrap(), None);
        assert!(incremental_query(None, Some("yesterday")).is_err());
    }
}
