//! OAuth token lifecycle for connected mailbox accounts.
//!
//! [`TokenVault::access_token`] is the only way the rest of the crate gets
//! a bearer token. If the stored token expires within the refresh window
//! (5 minutes by default) it is refreshed and persisted first. The
//! check-and-refresh sequence runs under a per-account async mutex, so
//! concurrent callers for the same account trigger at most one refresh.
//!
//! Refresh failures are never papered over with the stale token. A rejected
//! refresh token surfaces as [`LedgerError::ReauthorizationRequired`]; the
//! stored tokens are left in place until the user reconnects or
//! disconnects explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use inbox_ledger_core::{LedgerError, Store, SyncState};

use crate::traits::{classify, OAuthClient};

/// True when a token expiring at `expires_at` must be refreshed before use
/// at `now`. A missing expiry is treated as expired.
pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    match expires_at {
        Some(expiry) => expiry - now <= window,
        None => true,
    }
}

pub struct TokenVault {
    store: Arc<dyn Store>,
    oauth: Arc<dyn OAuthClient>,
    window: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenVault {
    pub fn new(store: Arc<dyn Store>, oauth: Arc<dyn OAuthClient>, window: Duration) -> Self {
        Self {
            store,
            oauth,
            window,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn account_lock(&self, account_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("token vault lock poisoned"))?;
        Ok(locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Return a valid access token for `account_id`, refreshing it first
    /// when it is inside the safety window.
    pub async fn access_token(&self, account_id: &str) -> Result<String> {
        let lock = self.account_lock(account_id)?;
        let _held = lock.lock().await;

        let state = self
            .store
            .get_sync_state(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;

        if !state.connected {
            return Err(LedgerError::AccountDisconnected(account_id.to_string()).into());
        }

        if let Some(token) = &state.access_token {
            if !needs_refresh(state.token_expires_at, Utc::now(), self.window) {
                return Ok(token.clone());
            }
        }

        let refresh_token = state.refresh_token.as_deref().ok_or_else(|| {
            LedgerError::ReauthorizationRequired {
                account_id: account_id.to_string(),
                reason: "no refresh token stored".to_string(),
            }
        })?;

        debug!(account = account_id, "refreshing access token");
        let grant = match self.oauth.refresh(refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                let err = classify(account_id, e);
                warn!(account = account_id, error = %err, "token refresh failed");
                return Err(err);
            }
        };

        let expires_at = Utc::now() + Duration::seconds(grant.expires_in_secs);
        self.store
            .update_tokens(
                account_id,
                &grant.access_token,
                grant.refresh_token.as_deref(),
                expires_at,
            )
            .await?;
        info!(account = account_id, %expires_at, "access token refreshed");
        Ok(grant.access_token)
    }

    /// Complete the OAuth handshake for an account. Creates the sync state
    /// on first connection; reconnecting an existing account replaces its
    /// tokens and keeps its history.
    pub async fn connect(
        &self,
        account_id: &str,
        email: &str,
        label: Option<String>,
        code: &str,
        redirect_uri: &str,
    ) -> Result<SyncState> {
        let lock = self.account_lock(account_id)?;
        let _held = lock.lock().await;

        let grant = self
            .oauth
            .exchange_code(code, redirect_uri)
            .await
            .map_err(|e| classify(account_id, e))?;
        let refresh_token = grant.refresh_token.ok_or_else(|| {
            LedgerError::ExternalApi(
                "authorization response carried no refresh token (offline access not granted)"
                    .to_string(),
            )
        })?;

        let mut state = match self.store.get_sync_state(account_id).await? {
            Some(existing) => existing,
            None => SyncState::new(account_id, email, None),
        };
        state.email = email.to_string();
        if label.is_some() {
            state.label = label;
        }
        state.access_token = Some(grant.access_token);
        state.refresh_token = Some(refresh_token);
        state.token_expires_at = Some(Utc::now() + Duration::seconds(grant.expires_in_secs));
        state.connected = true;

        self.store.upsert_sync_state(&state).await?;
        info!(account = account_id, email, "account connected");
        Ok(state)
    }

    /// Discard all tokens and clear the connected flag.
    pub async fn disconnect(&self, account_id: &str) -> Result<()> {
        let lock = self.account_lock(account_id)?;
        let _held = lock.lock().await;

        if self.store.get_sync_state(account_id).await?.is_none() {
            return Err(LedgerError::AccountNotFound(account_id.to_string()).into());
        }
        self.store.disconnect(account_id).await?;
        info!(account = account_id, "account disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ApiError, TokenGrant};
    use async_trait::async_trait;
    use inbox_ledger_core::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingOAuth {
        refreshes: AtomicUsize,
        revoked: bool,
    }

    #[async_trait]
    impl OAuthClient for CountingOAuth {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.revoked {
                return Err(ApiError::InvalidGrant("Token has been revoked".into()).into());
            }
            Ok(TokenGrant {
                access_token: "fresh".into(),
                refresh_token: None,
                expires_in_secs: 3600,
            })
        }

        async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<TokenGrant> {
            Ok(TokenGrant {
                access_token: format!("at-{}", code),
                refresh_token: Some("rt".into()),
                expires_in_secs: 3600,
            })
        }
    }

    async fn vault_with_expiry(
        expires_in: Duration,
        oauth: Arc<CountingOAuth>,
    ) -> (TokenVault, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let mut state = SyncState::new("acct", "me@example.com", None);
        state.access_token = Some("stale".into());
        state.refresh_token = Some("rt".into());
        state.token_expires_at = Some(Utc::now() + expires_in);
        state.connected = true;
        store.upsert_sync_state(&state).await.unwrap();
        let vault = TokenVault::new(store.clone(), oauth, Duration::minutes(5));
        (vault, store)
    }

    #[test]
    fn window_arithmetic() {
        let now = Utc::now();
        let window = Duration::minutes(5);
        assert!(needs_refresh(Some(now + Duration::minutes(4)), now, window));
        assert!(needs_refresh(Some(now + Duration::minutes(5)), now, window));
        assert!(!needs_refresh(Some(now + Duration::minutes(10)), now, window));
        assert!(needs_refresh(Some(now - Duration::minutes(1)), now, window));
        assert!(needs_refresh(None, now, window));
    }

    #[tokio::test]
    async fn refreshes_inside_window() {
        let oauth = Arc::new(CountingOAuth::default());
        let (vault, store) = vault_with_expiry(Duration::minutes(4), oauth.clone()).await;

        assert_eq!(vault.access_token("acct").await.unwrap(), "fresh");
        assert_eq!(oauth.refreshes.load(Ordering::SeqCst), 1);

        let state = store.get_sync_state("acct").await.unwrap().unwrap();
        assert_eq!(state.access_token.as_deref(), Some("fresh"));
        // Refresh token was not rotated, so the old one is kept.
        assert_eq!(state.refresh_token.as_deref(), Some("rt"));
        assert!(state.token_expires_at.unwrap() > Utc::now() + Duration::minutes(50));
    }

    #[tokio::test]
    async fn no_refresh_outside_window() {
        let oauth = Arc::new(CountingOAuth::default());
        let (vault, _) = vault_with_expiry(Duration::minutes(10), oauth.clone()).await;

        assert_eq!(vault.access_token("acct").await.unwrap(), "stale");
        assert_eq!(oauth.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let oauth = Arc::new(CountingOAuth::default());
        let (vault, _) = vault_with_expiry(Duration::minutes(1), oauth.clone()).await;
        let vault = Arc::new(vault);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let vault = vault.clone();
            handles.push(tokio::spawn(async move { vault.access_token("acct").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "fresh");
        }
        assert_eq!(oauth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_refresh_requires_reauthorization() {
        let oauth = Arc::new(CountingOAuth {
            revoked: true,
            ..Default::default()
        });
        let (vault, _) = vault_with_expiry(Duration::minutes(1), oauth).await;

        let err = vault.access_token("acct").await.unwrap_err();
        assert!(LedgerError::is_reauthorization(&err));
    }

    #[tokio::test]
    async fn disconnected_account_never_refreshes() {
        let oauth = Arc::new(CountingOAuth::default());
        let (vault, _) = vault_with_expiry(Duration::minutes(1), oauth.clone()).await;
        vault.disconnect("acct").await.unwrap();

        let err = vault.access_token("acct").await.unwrap_err();
        assert!(matches!(
            LedgerError::find(&err),
            Some(LedgerError::AccountDisconnected(_))
        ));
        assert_eq!(oauth.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_creates_state_on_handshake() {
        let store = Arc::new(InMemoryStore::new());
        let vault = TokenVault::new(
            store.clone(),
            Arc::new(CountingOAuth::default()),
            Duration::minutes(5),
        );
        let state = vault
            .connect("acct", "me@example.com", Some("Label_7".into()), "code1", "urn:ietf:wg:oauth:2.0:oob")
            .await
            .unwrap();
        assert!(state.connected);
        assert_eq!(state.label.as_deref(), Some("Label_7"));
        assert_eq!(vault.access_token("acct").await.unwrap(), "at-code1");
    }
}
