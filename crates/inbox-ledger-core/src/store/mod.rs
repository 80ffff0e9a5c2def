//! Storage abstraction for Inbox Ledger.
//!
//! The [`Store`] trait covers every persistence operation the sync
//! orchestrator, token vault, and integrity auditor need, so backends
//! are pluggable (SQLite in the application crate, in-memory here).
//!
//! Each method is an independent unit of work. Nothing in the batch
//! pipeline relies on multi-statement atomicity: a message and its derived
//! transaction are committed separately, and the auditor finds the gaps.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mode::MessageSelection;
use crate::models::{Card, Message, ParseState, Rule, SyncState, Transaction};

/// A message together with the number of transactions referencing it.
///
/// Used by the integrity auditor for orphan/duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageLink {
    pub message_id: String,
    pub external_id: String,
    pub subject: String,
    pub parse_state: ParseState,
    pub parse_error: Option<String>,
    pub rule_id: Option<String>,
    pub transaction_count: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Accounts | [`upsert_sync_state`](Store::upsert_sync_state), [`get_sync_state`](Store::get_sync_state), [`list_sync_states`](Store::list_sync_states), [`update_tokens`](Store::update_tokens), [`disconnect`](Store::disconnect), [`set_last_sync`](Store::set_last_sync) |
/// | Messages | [`message_exists`](Store::message_exists), [`insert_message`](Store::insert_message), [`select_messages`](Store::select_messages), [`set_parse_state`](Store::set_parse_state) |
/// | Transactions | [`insert_transaction`](Store::insert_transaction), [`count_transactions_for_message`](Store::count_transactions_for_message), [`list_transactions`](Store::list_transactions), [`delete_transaction`](Store::delete_transaction) |
/// | Rules | [`insert_rule`](Store::insert_rule), [`list_rules`](Store::list_rules), [`record_rule_hit`](Store::record_rule_hit) |
/// | Cards | [`insert_card`](Store::insert_card), [`find_card_by_suffix`](Store::find_card_by_suffix) |
/// | Audit | [`message_links`](Store::message_links) |
/// | Batches | [`try_acquire_batch_lease`](Store::try_acquire_batch_lease), [`renew_batch_lease`](Store::renew_batch_lease), [`release_batch_lease`](Store::release_batch_lease) |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace the sync state for `state.account_id`.
    async fn upsert_sync_state(&self, state: &SyncState) -> Result<()>;

    async fn get_sync_state(&self, account_id: &str) -> Result<Option<SyncState>>;

    /// All accounts, ordered by account id.
    async fn list_sync_states(&self) -> Result<Vec<SyncState>>;

    /// Persist a refreshed access token. `refresh_token` is only written
    /// when the provider rotated it.
    async fn update_tokens(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Discard every token field and clear the connected flag.
    async fn disconnect(&self, account_id: &str) -> Result<()>;

    async fn set_last_sync(&self, account_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn message_exists(&self, account_id: &str, external_id: &str) -> Result<bool>;

    /// Insert a new message. Returns `false` without writing when a
    /// message with the same `(account_id, external_id)` already exists.
    async fn insert_message(&self, message: &Message) -> Result<bool>;

    /// Messages for an account matching `selection`, oldest first.
    async fn select_messages(
        &self,
        account_id: &str,
        selection: &MessageSelection,
    ) -> Result<Vec<Message>>;

    async fn set_parse_state(
        &self,
        message_id: &str,
        state: ParseState,
        error: Option<&str>,
        rule_id: Option<&str>,
    ) -> Result<()>;

    async fn insert_transaction(&self, txn: &Transaction) -> Result<()>;

    async fn count_transactions_for_message(&self, message_id: &str) -> Result<i64>;

    async fn list_transactions(&self, account_id: &str) -> Result<Vec<Transaction>>;

    /// Returns `true` when a transaction was deleted.
    async fn delete_transaction(&self, id: &str) -> Result<bool>;

    /// Insert a rule, assigning the next `created_seq`. Returns the stored rule.
    async fn insert_rule(&self, rule: &Rule) -> Result<Rule>;

    /// All rules (active and inactive), in evaluation order.
    async fn list_rules(&self) -> Result<Vec<Rule>>;

    async fn record_rule_hit(&self, rule_id: &str) -> Result<()>;

    async fn insert_card(&self, card: &Card) -> Result<()>;

    async fn find_card_by_suffix(&self, suffix: &str) -> Result<Option<Card>>;

    /// Every message of an account with its transaction count.
    async fn message_links(&self, account_id: &str) -> Result<Vec<MessageLink>>;

    /// Take the batch lease on `account_id` for `holder`. Succeeds when no
    /// lease exists or the current one was last renewed before
    /// `stale_before`; returns `false` while any other fresh lease is held,
    /// including one held by `holder` itself.
    async fn try_acquire_batch_lease(
        &self,
        account_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Push the lease's renewal time to `now` if `holder` still owns it.
    async fn renew_batch_lease(&self, account_id: &str, holder: &str, now: DateTime<Utc>)
        -> Result<()>;

    /// Drop the lease if `holder` still owns it.
    async fn release_batch_lease(&self, account_id: &str, holder: &str) -> Result<()>;
}
