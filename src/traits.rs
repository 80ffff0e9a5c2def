//! Seams to the two external systems: the mailbox API and the OAuth token
//! endpoint.
//!
//! ```text
//! ┌────────────┐  access token   ┌───────────┐  RawMessage  ┌──────────────────┐
//! │ TokenVault │ ──────────────▶ │  Mailbox  │ ───────────▶ │ SyncOrchestrator │
//! └─────┬──────┘                 └───────────┘              └──────────────────┘
//!       │ refresh / exchange
//!       ▼
//! ┌─────────────┐
//! │ OAuthClient │
//! └─────────────┘
//! ```
//!
//! Production implementations live in [`crate::mailbox`] and
//! [`crate::oauth`]; tests substitute in-process fakes.
//!
//! Both traits return `anyhow::Result`. Implementations signal
//! authorization problems by putting an [`ApiError`] in the error chain;
//! [`classify`] turns that into the account-scoped [`LedgerError`].

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use inbox_ledger_core::{LedgerError, RawMessage};

// ═══════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════

/// Failure talking to an external API, before it is tied to an account.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// HTTP 401 from the mailbox: the access token was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The OAuth provider rejected the refresh token or authorization code.
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Transient failures worth retrying: throttling, server errors, and
    /// transport problems.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::Network(_) => true,
            _ => false,
        }
    }

    fn requires_reauthorization(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_) | ApiError::InvalidGrant(_))
    }
}

/// Map an external-call failure to the domain taxonomy for `account_id`.
///
/// Authorization failures become [`LedgerError::ReauthorizationRequired`];
/// everything else not already a [`LedgerError`] becomes
/// [`LedgerError::ExternalApi`].
pub fn classify(account_id: &str, err: anyhow::Error) -> anyhow::Error {
    if LedgerError::find(&err).is_some() {
        return err;
    }
    let api = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ApiError>())
        .cloned();
    match api {
        Some(api) if api.requires_reauthorization() => {
            LedgerError::ReauthorizationRequired {
                account_id: account_id.to_string(),
                reason: api.to_string(),
            }
            .into()
        }
        _ => LedgerError::ExternalApi(format!("{:#}", err)).into(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Mailbox
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailboxLabel {
    pub id: String,
    pub name: String,
}

/// One page of message identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    /// `None` on the last page.
    pub next_page_token: Option<String>,
}

/// Read-only access to a user's mailbox.
///
/// Every call takes the bearer token explicitly so the mailbox client holds
/// no per-account state; the [`TokenVault`](crate::token_vault::TokenVault)
/// owns token lifetime.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn list_labels(&self, access_token: &str) -> Result<Vec<MailboxLabel>>;

    /// List message ids, newest first, optionally restricted to a label.
    async fn list_message_ids(
        &self,
        access_token: &str,
        label: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<MessagePage>;

    /// Fetch and decode one message.
    async fn get_message(&self, access_token: &str, external_id: &str) -> Result<RawMessage>;
}

// ═══════════════════════════════════════════════════════════════════════
// OAuth
// ═══════════════════════════════════════════════════════════════════════

/// Tokens issued by the OAuth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present on the initial exchange, and on refresh only when the
    /// provider rotates it.
    pub refresh_token: Option<String>,
    pub expires_in_secs: i64,
}

#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let status = |s| ApiError::Status {
            status: s,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!ApiError::Unauthorized("expired".into()).is_retryable());
        assert!(ApiError::Network("reset".into()).is_retryable());
    }

    #[test]
    fn unauthorized_becomes_reauthorization() {
        let err = classify("acct", ApiError::Unauthorized("token revoked".into()).into());
        assert!(LedgerError::is_reauthorization(&err));
    }

    #[test]
    fn invalid_grant_becomes_reauthorization() {
        let err = classify(
            "acct",
            anyhow::Error::from(ApiError::InvalidGrant("Token has been revoked".into()))
                .context("refresh failed"),
        );
        assert!(LedgerError::is_reauthorization(&err));
    }

    #[test]
    fn other_failures_become_external_api() {
        let err = classify(
            "acct",
            ApiError::Status {
                status: 404,
                body: "not found".into(),
            }
            .into(),
        );
        assert!(matches!(
            LedgerError::find(&err),
            Some(LedgerError::ExternalApi(_))
        ));
    }
}
