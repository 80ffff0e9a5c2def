//! Account lifecycle commands: connect, list, relabel, disconnect, and
//! mailbox label discovery.
//!
//! Accounts come into existence on their first successful OAuth handshake;
//! there is no separate "add" step.

use anyhow::Result;

use inbox_ledger_core::{LedgerError, SyncState};

use crate::ingest::SyncOrchestrator;
use crate::report::print_json;
use crate::traits::{classify, MailboxLabel};

pub async fn connect(
    orchestrator: &SyncOrchestrator,
    account_id: &str,
    email: &str,
    label: Option<String>,
    code: &str,
    redirect_uri: &str,
) -> Result<SyncState> {
    orchestrator
        .vault()
        .connect(account_id, email, label, code, redirect_uri)
        .await
}

pub async fn list_accounts(orchestrator: &SyncOrchestrator, json: bool) -> Result<()> {
    let accounts = orchestrator.store().list_sync_states().await?;
    if json {
        return print_json(&accounts);
    }
    if accounts.is_empty() {
        println!("No accounts. Connect one with `ibl account connect`.");
        return Ok(());
    }

    println!(
        "{:<18} {:<30} {:<16} {:<5} LAST SYNC",
        "ACCOUNT", "EMAIL", "LABEL", "CONN"
    );
    for a in &accounts {
        println!(
            "{:<18} {:<30} {:<16} {:<5} {}",
            a.account_id,
            a.email,
            a.label.as_deref().unwrap_or("-"),
            if a.connected { "yes" } else { "no" },
            a.last_sync_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
    }
    Ok(())
}

/// Set (or clear, with `None`) the mailbox label alerts are pulled from.
pub async fn set_label(
    orchestrator: &SyncOrchestrator,
    account_id: &str,
    label: Option<String>,
) -> Result<SyncState> {
    let store = orchestrator.store();
    let mut state = store
        .get_sync_state(account_id)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
    state.label = label;
    store.upsert_sync_state(&state).await?;
    Ok(state)
}

/// Labels available in the account's mailbox.
pub async fn list_labels(
    orchestrator: &SyncOrchestrator,
    account_id: &str,
) -> Result<Vec<MailboxLabel>> {
    let state = orchestrator
        .store()
        .get_sync_state(account_id)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
    if !state.connected {
        return Err(LedgerError::AccountDisconnected(account_id.to_string()).into());
    }

    let token = orchestrator.vault().access_token(account_id).await?;
    let mut labels = orchestrator
        .mailbox()
        .list_labels(&token)
        .await
        .map_err(|e| classify(account_id, e))?;
    labels.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(labels)
}
