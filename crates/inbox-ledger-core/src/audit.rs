//! Integrity auditor: a read-only reconciliation pass over one account.
//!
//! Findings:
//!
//! - **orphaned**: `parsed_ok` messages with no transaction
//! - **duplicated**: messages referenced by more than one transaction
//! - **parse errors**: `parsed_error` messages, with their recorded reason
//! - **broken links**: email-sourced transactions with no message reference,
//!   or a reference to a message that does not exist
//! - **dead rule references**: inactive (or deleted) rules still recorded as
//!   the owning rule of some message
//!
//! Each finding carries a total count and at most `sample_limit` samples.
//! The auditor never writes; orphans are repaired by the `smart-full` parse
//! mode.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{ParseState, TransactionSource};
use crate::store::Store;

/// One sampled record in an audit finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditSample {
    pub id: String,
    pub detail: String,
}

/// Count plus a bounded sample of affected records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub count: u64,
    pub samples: Vec<AuditSample>,
}

impl Finding {
    fn push(&mut self, limit: usize, id: &str, detail: impl Into<String>) {
        self.count += 1;
        if self.samples.len() < limit {
            self.samples.push(AuditSample {
                id: id.to_string(),
                detail: detail.into(),
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub account_id: String,
    pub generated_at: DateTime<Utc>,
    pub messages: u64,
    pub transactions: u64,
    pub orphaned: Finding,
    pub duplicated: Finding,
    pub parse_errors: Finding,
    pub broken_links: Finding,
    pub dead_rule_references: Finding,
}

impl AuditReport {
    /// True when no finding has any records.
    pub fn is_clean(&self) -> bool {
        [
            &self.orphaned,
            &self.duplicated,
            &self.parse_errors,
            &self.broken_links,
            &self.dead_rule_references,
        ]
        .iter()
        .all(|f| f.count == 0)
    }
}

/// Audit every message and transaction stored for `account_id`.
pub async fn audit_account(
    store: &dyn Store,
    account_id: &str,
    sample_limit: usize,
) -> Result<AuditReport> {
    let links = store
        .message_links(account_id)
        .await
        .context("Failed to load messages for audit")?;
    let transactions = store
        .list_transactions(account_id)
        .await
        .context("Failed to load transactions for audit")?;
    let rules = store.list_rules().await.context("Failed to load rules")?;

    let mut report = AuditReport {
        account_id: account_id.to_string(),
        generated_at: Utc::now(),
        messages: links.len() as u64,
        transactions: transactions.len() as u64,
        orphaned: Finding::default(),
        duplicated: Finding::default(),
        parse_errors: Finding::default(),
        broken_links: Finding::default(),
        dead_rule_references: Finding::default(),
    };

    let active: HashMap<&str, bool> = rules
        .iter()
        .map(|r| (r.id.as_str(), r.is_active))
        .collect();
    // One entry per rule id, so a rule referenced by many messages counts once.
    let mut dead_rules: HashMap<&str, u64> = HashMap::new();

    for link in &links {
        if link.parse_state == ParseState::ParsedOk && link.transaction_count == 0 {
            report
                .orphaned
                .push(sample_limit, &link.message_id, link.subject.clone());
        }
        if link.transaction_count > 1 {
            report.duplicated.push(
                sample_limit,
                &link.message_id,
                format!("{} transactions", link.transaction_count),
            );
        }
        if link.parse_state == ParseState::ParsedError {
            report.parse_errors.push(
                sample_limit,
                &link.message_id,
                link.parse_error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            );
        }
        if let Some(rule_id) = link.rule_id.as_deref() {
            if !active.get(rule_id).copied().unwrap_or(false) {
                *dead_rules.entry(rule_id).or_insert(0) += 1;
            }
        }
    }

    let message_ids: HashSet<&str> = links.iter().map(|l| l.message_id.as_str()).collect();
    for txn in transactions
        .iter()
        .filter(|t| t.source == TransactionSource::Email)
    {
        match txn.message_id.as_deref() {
            None => report
                .broken_links
                .push(sample_limit, &txn.id, "no message reference"),
            Some(mid) if !message_ids.contains(mid) => report.broken_links.push(
                sample_limit,
                &txn.id,
                format!("references missing message {}", mid),
            ),
            Some(_) => {}
        }
    }

    let mut dead: Vec<(&str, u64)> = dead_rules.into_iter().collect();
    dead.sort();
    for (rule_id, count) in dead {
        let state = if active.contains_key(rule_id) {
            "inactive"
        } else {
            "deleted"
        };
        report.dead_rule_references.push(
            sample_limit,
            rule_id,
            format!("{} rule referenced by {} message(s)", state, count),
        );
    }

    Ok(report)
}
