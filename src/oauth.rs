//! OAuth 2.0 token endpoint client (Google).
//!
//! Two grants are used: `authorization_code` once, when an account is
//! connected, and `refresh_token` whenever the vault finds the access token
//! inside its refresh window. An `invalid_grant` response means the user
//! revoked access or the refresh token expired; it surfaces as
//! [`ApiError::InvalidGrant`] and ends in a reauthorization prompt.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{Config, OAuthConfig};
use crate::retry::{parse_retry_after, Backoff};
use crate::traits::{ApiError, OAuthClient, TokenGrant};

pub struct GoogleOAuthClient {
    http: reqwest::Client,
    token_url: String,
    oauth: OAuthConfig,
    backoff: Backoff,
}

impl GoogleOAuthClient {
    /// Build from config. Client credentials are resolved on each token
    /// request, so commands that never talk to the provider work without
    /// them.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.mailbox.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            token_url: config.oauth.token_url.clone(),
            oauth: config.oauth.clone(),
            backoff: Backoff::new(config.oauth.max_retries),
        })
    }

    /// Override the first backoff step (tests use milliseconds).
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.backoff.base_delay = delay;
        self
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant> {
        let client_id = self.oauth.resolve_client_id()?;
        let client_secret = self.oauth.resolve_client_secret()?;
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        form.extend_from_slice(params);
        Ok(self.post_form(&form).await?)
    }

    /// POST the form, retrying throttling, server errors and transport
    /// failures within the backoff budget.
    async fn post_form(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ApiError> {
        let mut last_err = None;
        let mut retry_after: Option<Duration> = None;

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt, retry_after.take());
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying token request");
                tokio::time::sleep(delay).await;
            }

            let response = match self.http.post(&self.token_url).form(form).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(ApiError::Network(e.to_string()));
                    continue;
                }
            };

            let status = response.status();
            retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();

            if status.is_success() {
                let parsed: TokenResponse =
                    serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
                return Ok(TokenGrant {
                    access_token: parsed.access_token,
                    refresh_token: parsed.refresh_token,
                    expires_in_secs: parsed.expires_in.unwrap_or(3600),
                });
            }

            let err = classify_token_error(status.as_u16(), &body);
            if !err.is_retryable() {
                return Err(err);
            }
            warn!(status = status.as_u16(), "transient token endpoint failure");
            last_err = Some(err);
        }

        Err(last_err.unwrap_or_else(|| ApiError::Network("token request failed after retries".into())))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

fn classify_token_error(status: u16, body: &str) -> ApiError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) if err.error == "invalid_grant" => {
            ApiError::InvalidGrant(err.error_description.unwrap_or(err.error))
        }
        _ if status == 401 => ApiError::Unauthorized(body.to_string()),
        _ => ApiError::Status {
            status,
            body: body.to_string(),
        },
    }
}

#[async_trait]
impl OAuthClient for GoogleOAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_is_recognised() {
        let err = classify_token_error(
            400,
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
        );
        assert_eq!(
            err,
            ApiError::InvalidGrant("Token has been expired or revoked.".into())
        );
    }

    #[test]
    fn other_token_errors_keep_status() {
        let err = classify_token_error(400, r#"{"error":"invalid_request"}"#);
        assert!(matches!(err, ApiError::Status { status: 400, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn unauthorized_client_maps_to_unauthorized() {
        let err = classify_token_error(401, "not json");
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }
}
