//! Wiring: builds the store, external clients, token vault, and
//! orchestrator from configuration. Shared by the CLI and the HTTP server
//! so both run the same entry points.

use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;

use inbox_ledger_core::Store;

use crate::config::Config;
use crate::db;
use crate::ingest::SyncOrchestrator;
use crate::mailbox::GmailClient;
use crate::oauth::GoogleOAuthClient;
use crate::sqlite_store::SqliteStore;
use crate::token_vault::TokenVault;
use crate::traits::{Mailbox, OAuthClient};

pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    let pool = db::connect(config).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

/// Assemble an orchestrator from explicit parts.
pub fn assemble(
    config: &Config,
    store: Arc<dyn Store>,
    mailbox: Arc<dyn Mailbox>,
    oauth: Arc<dyn OAuthClient>,
) -> Arc<SyncOrchestrator> {
    let vault = Arc::new(TokenVault::new(
        store.clone(),
        oauth,
        Duration::seconds(config.oauth.refresh_window_secs),
    ));
    Arc::new(SyncOrchestrator::new(
        store,
        mailbox,
        vault,
        config.mailbox.page_size,
        Duration::seconds(config.batch.lease_secs),
    ))
}

/// The production stack: SQLite, Gmail, Google OAuth.
pub async fn open(config: &Config) -> Result<Arc<SyncOrchestrator>> {
    let store = open_store(config).await?;
    let mailbox = Arc::new(GmailClient::new(&config.mailbox)?);
    let oauth = Arc::new(GoogleOAuthClient::from_config(config)?);
    Ok(assemble(config, store, mailbox, oauth))
}
