//! Gmail REST implementation of [`Mailbox`].
//!
//! # Endpoints
//!
//! | Call | Request |
//! |------|---------|
//! | labels | `GET {api_base}/users/me/labels` |
//! | list | `GET {api_base}/users/me/messages?maxResults=&pageToken=&labelIds=` |
//! | get | `GET {api_base}/users/me/messages/{id}?format=full` |
//!
//! # Retry strategy
//!
//! - HTTP 429 or 5xx → retry with exponential backoff (1s, 2s, 4s, … capped
//!   at 32s), or after the server's `Retry-After` when it sends one
//! - HTTP 401 → [`ApiError::Unauthorized`], never retried
//! - other HTTP 4xx → fail immediately
//! - network error → retry
//!
//! # Body decoding
//!
//! The MIME tree is walked depth-first. The first `text/plain` part wins;
//! otherwise the first `text/html` part is used with tags stripped. Part
//! data is base64url.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use inbox_ledger_core::RawMessage;

use crate::config::MailboxConfig;
use crate::retry::{parse_retry_after, Backoff};
use crate::traits::{ApiError, Mailbox, MailboxLabel, MessagePage};

/// Gmail API client. Stateless apart from the HTTP connection pool.
pub struct GmailClient {
    http: reqwest::Client,
    api_base: String,
    backoff: Backoff,
}

impl GmailClient {
    pub fn new(config: &MailboxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            backoff: Backoff::new(config.max_retries),
        })
    }

    /// Override the first backoff step (tests use milliseconds).
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.backoff.base_delay = delay;
        self
    }

    /// GET `url` with bearer auth, retrying transient failures.
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        access_token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let mut last_err = None;
        let mut retry_after: Option<Duration> = None;

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt, retry_after.take());
                debug!(attempt, delay_ms = delay.as_millis() as u64, url, "retrying mailbox call");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .get(url)
                .bearer_auth(access_token)
                .query(query)
                .send()
                .await;

            let response = match resp {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(ApiError::Network(e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| ApiError::Decode(e.to_string()));
            }

            retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let err = if status.as_u16() == 401 {
                ApiError::Unauthorized(body)
            } else {
                ApiError::Status {
                    status: status.as_u16(),
                    body,
                }
            };
            if !err.is_retryable() {
                return Err(err);
            }
            warn!(status = status.as_u16(), url, "transient mailbox failure");
            last_err = Some(err);
        }

        Err(last_err.unwrap_or_else(|| ApiError::Network("mailbox call failed after retries".into())))
    }
}

#[derive(Deserialize)]
struct LabelsResponse {
    #[serde(default)]
    labels: Vec<LabelEntry>,
}

#[derive(Deserialize)]
struct LabelEntry {
    id: String,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<ListEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ListEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GmailMessage {
    id: String,
    /// Milliseconds since the epoch, as a decimal string.
    internal_date: Option<String>,
    payload: Option<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<Part>,
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

#[async_trait]
impl Mailbox for GmailClient {
    async fn list_labels(&self, access_token: &str) -> Result<Vec<MailboxLabel>> {
        let url = format!("{}/users/me/labels", self.api_base);
        let resp: LabelsResponse = self.get_json(access_token, &url, &[]).await?;
        Ok(resp
            .labels
            .into_iter()
            .map(|l| MailboxLabel {
                id: l.id,
                name: l.name,
            })
            .collect())
    }

    async fn list_message_ids(
        &self,
        access_token: &str,
        label: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<MessagePage> {
        let url = format!("{}/users/me/messages", self.api_base);
        let mut query = vec![("maxResults", page_size.to_string())];
        if let Some(label) = label {
            query.push(("labelIds", label.to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let resp: ListResponse = self.get_json(access_token, &url, &query).await?;
        Ok(MessagePage {
            ids: resp.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: resp.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn get_message(&self, access_token: &str, external_id: &str) -> Result<RawMessage> {
        let url = format!("{}/users/me/messages/{}", self.api_base, external_id);
        let msg: GmailMessage = self
            .get_json(access_token, &url, &[("format", "full".to_string())])
            .await?;
        Ok(decode_message(msg))
    }
}

pub(crate) fn decode_message(msg: GmailMessage) -> RawMessage {
    let received_at = msg
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    let (sender, subject, body) = match &msg.payload {
        Some(payload) => (
            header(payload, "From").unwrap_or_default(),
            header(payload, "Subject").unwrap_or_default(),
            extract_body(payload),
        ),
        None => Default::default(),
    };

    RawMessage {
        external_id: msg.id,
        sender,
        subject,
        body,
        received_at,
    }
}

fn header(part: &Part, name: &str) -> Option<String> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn extract_body(payload: &Part) -> String {
    if let Some(text) = find_part(payload, "text/plain") {
        return text;
    }
    find_part(payload, "text/html")
        .map(|html| strip_html(&html))
        .unwrap_or_default()
}

fn find_part(part: &Part, mime: &str) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case(mime) {
        if let Some(text) = part
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(decode_base64url)
        {
            return Some(text);
        }
    }
    part.parts.iter().find_map(|p| find_part(p, mime))
}

fn decode_base64url(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim().trim_end_matches('=')).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn strip_html(html: &str) -> String {
    static BLOCKS: OnceLock<Option<Regex>> = OnceLock::new();
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();
    static BREAKS: OnceLock<Option<Regex>> = OnceLock::new();

    let blocks = BLOCKS.get_or_init(|| Regex::new(r"(?is)<(?:style|script)[^>]*>.*?</(?:style|script)>").ok());
    let breaks = BREAKS.get_or_init(|| Regex::new(r"(?i)<br\s*/?>|</(?:p|div|tr|li|h\d)>").ok());
    let tags = TAGS.get_or_init(|| Regex::new(r"<[^>]*>").ok());

    let mut text = html.to_string();
    if let Some(re) = blocks {
        text = re.replace_all(&text, "").into_owned();
    }
    if let Some(re) = breaks {
        text = re.replace_all(&text, "\n").into_owned();
    }
    if let Some(re) = tags {
        text = re.replace_all(&text, " ").into_owned();
    }

    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
