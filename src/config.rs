//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/ledger.sqlite"
//!
//! [oauth]
//! client_id = "1234.apps.googleusercontent.com"
//! client_secret_env = "INBOX_LEDGER_CLIENT_SECRET"
//!
//! [mailbox]
//! page_size = 100
//! fetch_cap = 200
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```
//!
//! Secrets never live in the file: each secret-bearing section names the
//! environment variable to read instead.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// How long a writer waits on another process's lock before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct OAuthConfig {
    /// Falls back to `INBOX_LEDGER_CLIENT_ID` when unset.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Tokens expiring within this many seconds are refreshed before use.
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: i64,
    /// Retries for throttled or failed token requests. `invalid_grant` is
    /// never retried.
    #[serde(default = "default_oauth_max_retries")]
    pub max_retries: u32,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret_env: default_client_secret_env(),
            token_url: default_token_url(),
            refresh_window_secs: default_refresh_window_secs(),
            max_retries: default_oauth_max_retries(),
        }
    }
}

fn default_client_secret_env() -> String {
    "INBOX_LEDGER_CLIENT_SECRET".to_string()
}
fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_refresh_window_secs() -> i64 {
    300
}
fn default_oauth_max_retries() -> u32 {
    3
}

impl OAuthConfig {
    pub fn resolve_client_id(&self) -> Result<String> {
        match &self.client_id {
            Some(id) if !id.trim().is_empty() => Ok(id.clone()),
            _ => std::env::var("INBOX_LEDGER_CLIENT_ID").map_err(|_| {
                anyhow::anyhow!("oauth.client_id is not set and INBOX_LEDGER_CLIENT_ID is missing")
            }),
        }
    }

    pub fn resolve_client_secret(&self) -> Result<String> {
        std::env::var(&self.client_secret_env).map_err(|_| {
            anyhow::anyhow!(
                "OAuth client secret not found: set the {} environment variable",
                self.client_secret_env
            )
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailboxConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Maximum new messages per interactive sync.
    #[serde(default = "default_fetch_cap")]
    pub fetch_cap: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            page_size: default_page_size(),
            fetch_cap: default_fetch_cap(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_api_base() -> String {
    "https://gmail.googleapis.com/gmail/v1".to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_fetch_cap() -> usize {
    200
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_cron_secret_env")]
    pub cron_secret_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cron_secret_env: default_cron_secret_env(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}
fn default_cron_secret_env() -> String {
    "INBOX_LEDGER_CRON_SECRET".to_string()
}

impl ServerConfig {
    /// The scheduler secret, if the environment provides one. Without it the
    /// scheduled trigger rejects every call.
    pub fn cron_secret(&self) -> Option<String> {
        std::env::var(&self.cron_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sample_limit: default_sample_limit(),
        }
    }
}

fn default_sample_limit() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    /// A batch lease not renewed for this long is considered abandoned.
    /// Running batches renew every third of it.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_lease_secs() -> i64 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.db.max_connections == 0 {
        bail!("db.max_connections must be >= 1");
    }
    if !(1..=500).contains(&config.mailbox.page_size) {
        bail!("mailbox.page_size must be in 1..=500");
    }
    if config.mailbox.max_retries > 10 {
        bail!("mailbox.max_retries must be <= 10");
    }
    if config.mailbox.timeout_secs == 0 {
        bail!("mailbox.timeout_secs must be > 0");
    }
    if config.mailbox.fetch_cap == 0 {
        bail!("mailbox.fetch_cap must be > 0");
    }
    if config.oauth.max_retries > 10 {
        bail!("oauth.max_retries must be <= 10");
    }
    if config.oauth.refresh_window_secs <= 0 {
        bail!("oauth.refresh_window_secs must be > 0");
    }
    if config.batch.lease_secs < 3 {
        bail!("batch.lease_secs must be >= 3");
    }
    if config.audit.sample_limit == 0 {
        bail!("audit.sample_limit must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config("[db]\npath = \"./data/ledger.sqlite\"\n").unwrap();
        assert_eq!(config.mailbox.page_size, 100);
        assert_eq!(config.mailbox.fetch_cap, 200);
        assert_eq!(config.oauth.refresh_window_secs, 300);
        assert_eq!(config.oauth.max_retries, 3);
        assert_eq!(config.server.bind, "127.0.0.1:7341");
        assert_eq!(config.audit.sample_limit, 20);
        assert_eq!(config.batch.lease_secs, 300);
    }

    #[test]
    fn rejects_out_of_range_page_size() {
        let err = parse_config("[db]\npath = \"x\"\n[mailbox]\npage_size = 501\n").unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn rejects_zero_refresh_window() {
        let err =
            parse_config("[db]\npath = \"x\"\n[oauth]\nrefresh_window_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("refresh_window_secs"));
    }

    #[test]
    fn rejects_missing_db_section() {
        assert!(parse_config("[server]\nbind = \"0.0.0.0:1\"\n").is_err());
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse_config(include_str!("../config/ledger.example.toml")).unwrap();
        assert_eq!(config.mailbox.api_base, "https://gmail.googleapis.com/gmail/v1");
        assert_eq!(config.server.cron_secret_env, "INBOX_LEDGER_CRON_SECRET");
    }
}
