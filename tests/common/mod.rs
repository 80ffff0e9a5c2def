//! Shared fixtures: in-process fakes of the mailbox and OAuth endpoint,
//! and a migrated SQLite database in a temp dir.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use inbox_ledger::app;
use inbox_ledger::config::{parse_config, Config};
use inbox_ledger::ingest::SyncOrchestrator;
use inbox_ledger::migrate;
use inbox_ledger::traits::{
    ApiError, Mailbox, MailboxLabel, MessagePage, OAuthClient, TokenGrant,
};
use inbox_ledger_core::{RawMessage, Rule, Store};

// ─── Fake mailbox ───────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeMailbox {
    messages: Mutex<Vec<RawMessage>>,
    failing: Mutex<HashSet<String>>,
    revoked: AtomicBool,
    /// Successful `get_message` calls allowed before access is revoked.
    revoke_after: Mutex<Option<usize>>,
    pub get_calls: AtomicUsize,
}

impl FakeMailbox {
    pub fn new(messages: Vec<RawMessage>) -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(messages),
            ..Default::default()
        })
    }

    pub fn push(&self, message: RawMessage) {
        self.messages.lock().unwrap().push(message);
    }

    /// `get_message` for this id answers HTTP 500.
    pub fn fail(&self, external_id: &str) {
        self.failing.lock().unwrap().insert(external_id.to_string());
    }

    /// Every call answers HTTP 401.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    /// Revoke access once `n` messages have been fetched.
    pub fn revoke_after(&self, n: usize) {
        *self.revoke_after.lock().unwrap() = Some(n);
    }

    fn check_auth(&self) -> Result<()> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized("token revoked".into()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn list_labels(&self, _access_token: &str) -> Result<Vec<MailboxLabel>> {
        self.check_auth()?;
        Ok(vec![
            MailboxLabel {
                id: "Label_2".into(),
                name: "Alerts".into(),
            },
            MailboxLabel {
                id: "INBOX".into(),
                name: "INBOX".into(),
            },
        ])
    }

    async fn list_message_ids(
        &self,
        _access_token: &str,
        _label: Option<&str>,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<MessagePage> {
        self.check_auth()?;
        let ids: Vec<String> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.external_id.clone())
            .collect();
        let start: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let end = (start + page_size as usize).min(ids.len());
        Ok(MessagePage {
            ids: ids[start..end].to_vec(),
            next_page_token: (end < ids.len()).then(|| end.to_string()),
        })
    }

    async fn get_message(&self, _access_token: &str, external_id: &str) -> Result<RawMessage> {
        self.check_auth()?;
        let calls = self.get_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.revoke_after.lock().unwrap().is_some_and(|n| calls > n) {
            self.revoke();
            self.check_auth()?;
        }
        if self.failing.lock().unwrap().contains(external_id) {
            return Err(ApiError::Status {
                status: 500,
                body: "backend error".into(),
            }
            .into());
        }
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.external_id == external_id)
            .cloned()
            .ok_or_else(|| {
                ApiError::Status {
                    status: 404,
                    body: "not found".into(),
                }
                .into()
            })
    }
}

// ─── Fake OAuth endpoint ────────────────────────────────────────────

#[derive(Default)]
pub struct FakeOAuth {
    revoked: AtomicBool,
    /// Lifetime handed out on every grant.
    pub expires_in_secs: std::sync::atomic::AtomicI64,
    pub refreshes: AtomicUsize,
}

impl FakeOAuth {
    pub fn new() -> Arc<Self> {
        let oauth = Self::default();
        oauth.expires_in_secs.store(3600, Ordering::SeqCst);
        Arc::new(oauth)
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl OAuthClient for FakeOAuth {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.revoked.load(Ordering::SeqCst) {
            return Err(ApiError::InvalidGrant("Token has been expired or revoked.".into()).into());
        }
        Ok(TokenGrant {
            access_token: "refreshed-access".into(),
            refresh_token: None,
            expires_in_secs: self.expires_in_secs.load(Ordering::SeqCst),
        })
    }

    async fn exchange_code(&self, _code: &str, _redirect_uri: &str) -> Result<TokenGrant> {
        Ok(TokenGrant {
            access_token: "initial-access".into(),
            refresh_token: Some("refresh-1".into()),
            expires_in_secs: self.expires_in_secs.load(Ordering::SeqCst),
        })
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

pub fn test_config(tmp: &TempDir) -> Config {
    let db_path = tmp.path().join("ledger.sqlite");
    parse_config(&format!(
        r#"
[db]
path = "{}"

[mailbox]
page_size = 2
fetch_cap = 50
"#,
        db_path.display()
    ))
    .unwrap()
}

pub struct Harness {
    pub _tmp: TempDir,
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub mailbox: Arc<FakeMailbox>,
    pub oauth: Arc<FakeOAuth>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

pub async fn harness(messages: Vec<RawMessage>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    migrate::run_migrations(&config).await.unwrap();

    let store = app::open_store(&config).await.unwrap();
    let mailbox = FakeMailbox::new(messages);
    let oauth = FakeOAuth::new();
    let orchestrator = app::assemble(&config, store.clone(), mailbox.clone(), oauth.clone());

    Harness {
        _tmp: tmp,
        config,
        store,
        mailbox,
        oauth,
        orchestrator,
    }
}

impl Harness {
    pub async fn connect(&self, account_id: &str) {
        self.orchestrator
            .vault()
            .connect(
                account_id,
                &format!("{}@example.com", account_id),
                None,
                "auth-code",
                "http://localhost/callback",
            )
            .await
            .unwrap();
    }

    pub async fn add_acme_rule(&self) -> Rule {
        self.store.insert_rule(&acme_rule()).await.unwrap()
    }
}

/// Matches `alert(n)` messages.
pub fn acme_rule() -> Rule {
    let mut rule = Rule::new("Acme card alert", r"\$([\d,]+\.\d{2})");
    rule.priority = 10;
    rule.sender_pattern = Some(r"alerts@acme\.example".into());
    rule.merchant_pattern = Some(r"at (.+?)\.".into());
    rule.card_pattern = Some(r"ending in (\d{3,4})".into());
    rule.date_pattern = Some(r"on (\d{2}/\d{2}/\d{4})".into());
    rule.date_format = Some("%m/%d/%Y".into());
    rule
}

/// A card alert the Acme rule parses.
pub fn alert(n: u32) -> RawMessage {
    RawMessage {
        external_id: format!("ext-{}", n),
        sender: "Acme Bank <alerts@acme.example>".into(),
        subject: "Card purchase".into(),
        body: format!(
            "A purchase of ${}.50 on 03/0{}/2026 at Coffee Corner. Card ending in 4242.",
            10 + n,
            (n % 9) + 1
        ),
        received_at: Some(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, n % 60).unwrap()),
    }
}

/// A newsletter no rule matches.
pub fn newsletter(n: u32) -> RawMessage {
    RawMessage {
        external_id: format!("news-{}", n),
        sender: "news@shop.example".into(),
        subject: "Weekly deals".into(),
        body: "Nothing to see here.".into(),
        received_at: Some(Utc.with_ymd_and_hms(2026, 3, 11, 9, 0, n % 60).unwrap()),
    }
}
