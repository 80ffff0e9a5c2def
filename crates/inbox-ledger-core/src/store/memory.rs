//! In-memory [`Store`] implementation for tests and embedding.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Messages keep insertion order so "oldest first" falls out naturally
//! when receipt timestamps tie.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::mode::MessageSelection;
use crate::models::{Card, Message, ParseState, Rule, SyncState, Transaction};
use crate::rules::evaluation_order;

use super::{MessageLink, Store};

/// In-memory store for tests and single-process embedding.
pub struct InMemoryStore {
    accounts: RwLock<HashMap<String, SyncState>>,
    messages: RwLock<Vec<Message>>,
    transactions: RwLock<Vec<Transaction>>,
    rules: RwLock<Vec<Rule>>,
    cards: RwLock<Vec<Card>>,
    /// account id -> (holder, renewed at)
    leases: RwLock<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            transactions: RwLock::new(Vec::new()),
            rules: RwLock::new(Vec::new()),
            cards: RwLock::new(Vec::new()),
            leases: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_sync_state(&self, state: &SyncState) -> Result<()> {
        write(&self.accounts)?.insert(state.account_id.clone(), state.clone());
        Ok(())
    }

    async fn get_sync_state(&self, account_id: &str) -> Result<Option<SyncState>> {
        Ok(read(&self.accounts)?.get(account_id).cloned())
    }

    async fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        let mut states: Vec<SyncState> = read(&self.accounts)?.values().cloned().collect();
        states.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(states)
    }

    async fn update_tokens(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut accounts = write(&self.accounts)?;
        let state = accounts
            .get_mut(account_id)
            .ok_or_else(|| anyhow!("unknown account: {}", account_id))?;
        state.access_token = Some(access_token.to_string());
        if let Some(rt) = refresh_token {
            state.refresh_token = Some(rt.to_string());
        }
        state.token_expires_at = Some(expires_at);
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self, account_id: &str) -> Result<()> {
        let mut accounts = write(&self.accounts)?;
        if let Some(state) = accounts.get_mut(account_id) {
            state.access_token = None;
            state.refresh_token = None;
            state.token_expires_at = None;
            state.connected = false;
        }
        Ok(())
    }

    async fn set_last_sync(&self, account_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(state) = write(&self.accounts)?.get_mut(account_id) {
            state.last_sync_at = Some(at);
        }
        Ok(())
    }

    async fn message_exists(&self, account_id: &str, external_id: &str) -> Result<bool> {
        Ok(read(&self.messages)?
            .iter()
            .any(|m| m.account_id == account_id && m.external_id == external_id))
    }

    async fn insert_message(&self, message: &Message) -> Result<bool> {
        let mut messages = write(&self.messages)?;
        if messages
            .iter()
            .any(|m| m.account_id == message.account_id && m.external_id == message.external_id)
        {
            return Ok(false);
        }
        messages.push(message.clone());
        Ok(true)
    }

    async fn select_messages(
        &self,
        account_id: &str,
        selection: &MessageSelection,
    ) -> Result<Vec<Message>> {
        let messages = read(&self.messages)?;
        let transactions = read(&self.transactions)?;
        let has_txn = |id: &str| {
            transactions
                .iter()
                .any(|t| t.message_id.as_deref() == Some(id))
        };

        let mut selected: Vec<Message> = messages
            .iter()
            .filter(|m| m.account_id == account_id)
            .filter(|m| match selection {
                MessageSelection::Unparsed => m.parse_state == ParseState::Unparsed,
                MessageSelection::Orphaned => {
                    m.parse_state == ParseState::ParsedOk && !has_txn(&m.id)
                }
                MessageSelection::All => true,
                MessageSelection::Ids(ids) => ids.iter().any(|id| *id == m.id),
            })
            .cloned()
            .collect();
        // Stable sort: ties keep insertion order.
        selected.sort_by_key(|m| m.received_at);
        Ok(selected)
    }

    async fn set_parse_state(
        &self,
        message_id: &str,
        state: ParseState,
        error: Option<&str>,
        rule_id: Option<&str>,
    ) -> Result<()> {
        let mut messages = write(&self.messages)?;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| anyhow!("unknown message: {}", message_id))?;
        message.parse_state = state;
        message.parse_error = error.map(str::to_string);
        message.rule_id = rule_id.map(str::to_string);
        Ok(())
    }

    async fn insert_transaction(&self, txn: &Transaction) -> Result<()> {
        let mut transactions = write(&self.transactions)?;
        if transactions.iter().any(|t| t.id == txn.id) {
            bail!("duplicate transaction id: {}", txn.id);
        }
        transactions.push(txn.clone());
        Ok(())
    }

    async fn count_transactions_for_message(&self, message_id: &str) -> Result<i64> {
        Ok(read(&self.transactions)?
            .iter()
            .filter(|t| t.message_id.as_deref() == Some(message_id))
            .count() as i64)
    }

    async fn list_transactions(&self, account_id: &str) -> Result<Vec<Transaction>> {
        Ok(read(&self.transactions)?
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn delete_transaction(&self, id: &str) -> Result<bool> {
        let mut transactions = write(&self.transactions)?;
        let before = transactions.len();
        transactions.retain(|t| t.id != id);
        Ok(transactions.len() != before)
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<Rule> {
        let mut rules = write(&self.rules)?;
        if rules.iter().any(|r| r.id == rule.id) {
            bail!("duplicate rule id: {}", rule.id);
        }
        let mut stored = rule.clone();
        stored.created_seq = rules.iter().map(|r| r.created_seq).max().unwrap_or(0) + 1;
        rules.push(stored.clone());
        Ok(stored)
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        let mut rules = read(&self.rules)?.clone();
        rules.sort_by(evaluation_order);
        Ok(rules)
    }

    async fn record_rule_hit(&self, rule_id: &str) -> Result<()> {
        if let Some(rule) = write(&self.rules)?.iter_mut().find(|r| r.id == rule_id) {
            rule.hit_count += 1;
        }
        Ok(())
    }

    async fn insert_card(&self, card: &Card) -> Result<()> {
        let mut cards = write(&self.cards)?;
        if cards.iter().any(|c| c.suffix == card.suffix) {
            bail!("a card ending in {} already exists", card.suffix);
        }
        cards.push(card.clone());
        Ok(())
    }

    async fn find_card_by_suffix(&self, suffix: &str) -> Result<Option<Card>> {
        Ok(read(&self.cards)?
            .iter()
            .find(|c| c.suffix == suffix)
            .cloned())
    }

    async fn message_links(&self, account_id: &str) -> Result<Vec<MessageLink>> {
        let messages = read(&self.messages)?;
        let transactions = read(&self.transactions)?;
        Ok(messages
            .iter()
            .filter(|m| m.account_id == account_id)
            .map(|m| MessageLink {
                message_id: m.id.clone(),
                external_id: m.external_id.clone(),
                subject: m.subject.clone(),
                parse_state: m.parse_state,
                parse_error: m.parse_error.clone(),
                rule_id: m.rule_id.clone(),
                transaction_count: transactions
                    .iter()
                    .filter(|t| t.message_id.as_deref() == Some(m.id.as_str()))
                    .count() as i64,
            })
            .collect())
    }

    async fn try_acquire_batch_lease(
        &self,
        account_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut leases = write(&self.leases)?;
        if let Some((_, renewed_at)) = leases.get(account_id) {
            if *renewed_at >= stale_before {
                return Ok(false);
            }
        }
        leases.insert(account_id.to_string(), (holder.to_string(), now));
        Ok(true)
    }

    async fn renew_batch_lease(
        &self,
        account_id: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some((owner, renewed_at)) = write(&self.leases)?.get_mut(account_id) {
            if owner == holder {
                *renewed_at = now;
            }
        }
        Ok(())
    }

    async fn release_batch_lease(&self, account_id: &str, holder: &str) -> Result<()> {
        let mut leases = write(&self.leases)?;
        if leases.get(account_id).is_some_and(|(owner, _)| owner == holder) {
            leases.remove(account_id);
        }
        Ok(())
    }
}
