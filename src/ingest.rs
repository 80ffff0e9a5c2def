//! Sync orchestration: mailbox fetch, the four-mode parse driver, dry runs,
//! and the multi-account scheduled run.
//!
//! # Pipeline
//!
//! ```text
//! TokenVault ─▶ Mailbox ─▶ messages (unparsed) ─▶ ParseEngine ─▶ transactions
//!   token        pages       one insert each        pure           one insert each
//! ```
//!
//! Every message and every transaction is its own write. A run that is
//! cancelled, or aborted by an infrastructure failure, leaves everything
//! committed before that point intact and reports it in the
//! [`RunSummary`].
//!
//! # Failure scopes
//!
//! - A message that fails to fetch or parse is counted in the summary and
//!   the run continues.
//! - Authorization failures, exhausted mailbox retries on a listing call,
//!   and store errors end the run. The summary's `aborted` field says why.
//! - Unknown or disconnected accounts and a batch already running for the
//!   account are rejected before any work starts (`Err`).

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use inbox_ledger_core::{
    audit_account, AuditReport, LedgerError, Message, MessageSelection, ParseEngine, ParseMode,
    ParseOutcome, ParseState, RuleIssue, RunSummary, Store, SyncState, Transaction,
    TransactionSource, WritePolicy,
};

use crate::batch_guard::BatchGuard;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::token_vault::TokenVault;
use crate::traits::{classify, Mailbox};

/// Progress is reported every this many parsed messages.
const PROGRESS_EVERY: u64 = 25;

/// How much of the mailbox a fetch may pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    /// Stop after this many new messages (interactive sync).
    Capped(usize),
    /// Page through the whole mailbox (scheduled sync).
    AllPages,
}

/// Result of a dry run for one message. Nothing is written.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunItem {
    pub message_id: String,
    pub external_id: String,
    pub subject: String,
    pub parse_state: ParseState,
    pub outcome: ParseOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub account_id: String,
    pub active_rules: usize,
    pub rule_issues: Vec<RuleIssue>,
    pub succeeded: u64,
    pub failed: u64,
    /// Ids requested but not found for the account.
    pub missing: Vec<String>,
    pub items: Vec<DryRunItem>,
}

pub struct SyncOrchestrator {
    store: Arc<dyn Store>,
    mailbox: Arc<dyn Mailbox>,
    vault: Arc<TokenVault>,
    guard: BatchGuard,
    page_size: u32,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        mailbox: Arc<dyn Mailbox>,
        vault: Arc<TokenVault>,
        page_size: u32,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            guard: BatchGuard::new(store.clone(), lease_ttl),
            store,
            mailbox,
            vault,
            page_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn vault(&self) -> &Arc<TokenVault> {
        &self.vault
    }

    pub fn mailbox(&self) -> &Arc<dyn Mailbox> {
        &self.mailbox
    }

    async fn require_account(&self, account_id: &str) -> Result<SyncState> {
        self.store
            .get_sync_state(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()).into())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Entry points
    // ═══════════════════════════════════════════════════════════════════

    /// Fetch new mail for one account, then run a `quick` parse over the
    /// unparsed backlog.
    pub async fn sync(
        &self,
        account_id: &str,
        scope: FetchScope,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
    ) -> Result<RunSummary> {
        let lease = self.guard.acquire(account_id).await?;
        let result = self.run_sync(account_id, scope, cancel, progress).await;
        lease.release().await;
        result
    }

    async fn run_sync(
        &self,
        account_id: &str,
        scope: FetchScope,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
    ) -> Result<RunSummary> {
        let state = self.require_account(account_id).await?;
        if !state.connected {
            return Err(LedgerError::AccountDisconnected(account_id.to_string()).into());
        }

        info!(account = account_id, ?scope, "sync started");
        let mut summary = RunSummary::new(account_id, "sync");
        if let Err(e) = self
            .fetch(&state, scope, cancel, progress, &mut summary)
            .await
        {
            warn!(account = account_id, error = %format!("{:#}", e), "fetch aborted");
            summary.abort(&e);
        }

        if summary.aborted.is_none() && !summary.cancelled {
            let parsed = self
                .run_parse(account_id, ParseMode::Quick, cancel, progress)
                .await;
            summary.absorb(parsed);
        }

        self.complete(summary).await
    }

    /// Run one of the four parse modes over an account's stored messages.
    pub async fn parse(
        &self,
        account_id: &str,
        mode: ParseMode,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
    ) -> Result<RunSummary> {
        let lease = self.guard.acquire(account_id).await?;
        let result = match self.require_account(account_id).await {
            Ok(_) => {
                let summary = self.run_parse(account_id, mode, cancel, progress).await;
                self.complete(summary).await
            }
            Err(e) => Err(e),
        };
        lease.release().await;
        result
    }

    /// Parse messages with the current rules without writing anything.
    /// `message_ids = None` means every stored message of the account.
    pub async fn dry_run(
        &self,
        account_id: &str,
        message_ids: Option<Vec<String>>,
    ) -> Result<DryRunReport> {
        self.require_account(account_id).await?;

        let rules = self.store.list_rules().await?;
        let engine = ParseEngine::new(&rules);

        let selection = match &message_ids {
            Some(ids) => MessageSelection::Ids(ids.clone()),
            None => MessageSelection::All,
        };
        let messages = self.store.select_messages(account_id, &selection).await?;

        let missing = message_ids
            .unwrap_or_default()
            .into_iter()
            .filter(|id| !messages.iter().any(|m| &m.id == id))
            .collect();

        let mut report = DryRunReport {
            account_id: account_id.to_string(),
            active_rules: engine.rule_set().rules().len(),
            rule_issues: engine.rule_issues().to_vec(),
            succeeded: 0,
            failed: 0,
            missing,
            items: Vec::with_capacity(messages.len()),
        };
        for message in messages {
            let outcome = engine.parse(&message);
            if outcome.is_success() {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
            report.items.push(DryRunItem {
                message_id: message.id,
                external_id: message.external_id,
                subject: message.subject,
                parse_state: message.parse_state,
                outcome,
            });
        }
        Ok(report)
    }

    /// Read-only integrity audit of one account.
    pub async fn audit(&self, account_id: &str, sample_limit: usize) -> Result<AuditReport> {
        self.require_account(account_id).await?;
        audit_account(self.store.as_ref(), account_id, sample_limit).await
    }

    /// Sync every connected account concurrently. Accounts are independent:
    /// one account's failure, reauthorization included, never affects the
    /// others. Returns one summary per account, ordered by account id.
    pub async fn sync_all_connected(
        self: &Arc<Self>,
        scope: FetchScope,
        cancel: CancellationToken,
        progress: Arc<dyn SyncProgressReporter>,
    ) -> Result<Vec<RunSummary>> {
        let accounts: Vec<String> = self
            .store
            .list_sync_states()
            .await?
            .into_iter()
            .filter(|s| s.connected)
            .map(|s| s.account_id)
            .collect();

        info!(accounts = accounts.len(), "scheduled sync started");
        let mut tasks = JoinSet::new();
        for account_id in accounts {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            let progress = Arc::clone(&progress);
            tasks.spawn(async move {
                match this
                    .sync(&account_id, scope, &cancel, progress.as_ref())
                    .await
                {
                    Ok(summary) => summary,
                    Err(e) => {
                        let mut summary = RunSummary::new(&account_id, "sync");
                        summary.abort(&e);
                        summary.finish()
                    }
                }
            });
        }

        let mut summaries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(error = %e, "account sync task failed"),
            }
        }
        summaries.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(summaries)
    }

    /// Stamp `last_sync_at` on a completed run and close the summary.
    async fn complete(&self, summary: RunSummary) -> Result<RunSummary> {
        let mut summary = summary.finish();
        if summary.aborted.is_none() && !summary.cancelled {
            if let Err(e) = self.store.set_last_sync(&summary.account_id, Utc::now()).await {
                summary.abort(&e);
            }
        }
        info!(
            account = %summary.account_id,
            operation = %summary.operation,
            fetched = summary.fetched,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            aborted = summary.aborted.is_some(),
            "run finished"
        );
        Ok(summary)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Fetch sub-flow
    // ═══════════════════════════════════════════════════════════════════

    /// Page through the mailbox storing messages not yet seen for the
    /// account. `Err` means the run must stop.
    async fn fetch(
        &self,
        state: &SyncState,
        scope: FetchScope,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let account_id = state.account_id.as_str();
        let label = state.label.as_deref();
        let mut page_token: Option<String> = None;
        let mut page = 0u64;
        let mut listed = 0u64;

        'pages: loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            // Re-checked every page so long runs survive token expiry.
            let token = self.vault.access_token(account_id).await?;
            let listing = self
                .mailbox
                .list_message_ids(&token, label, page_token.as_deref(), self.page_size)
                .await
                .map_err(|e| classify(account_id, e))?;
            page += 1;
            listed += listing.ids.len() as u64;

            for external_id in &listing.ids {
                if let FetchScope::Capped(cap) = scope {
                    if summary.fetched as usize >= cap {
                        debug!(account = account_id, cap, "fetch cap reached");
                        break 'pages;
                    }
                }
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break 'pages;
                }
                if self.store.message_exists(account_id, external_id).await? {
                    summary.already_present += 1;
                    continue;
                }

                match self.mailbox.get_message(&token, external_id).await {
                    Ok(raw) => {
                        let message = Message::from_raw(account_id, raw);
                        if self.store.insert_message(&message).await? {
                            summary.fetched += 1;
                        } else {
                            summary.already_present += 1;
                        }
                    }
                    Err(e) => {
                        let err = classify(account_id, e);
                        if LedgerError::is_reauthorization(&err) {
                            return Err(err);
                        }
                        warn!(account = account_id, external_id = %external_id, error = %format!("{:#}", err), "message fetch failed");
                        summary.record_failure(
                            external_id,
                            "external_api_failure",
                            format!("{:#}", err),
                        );
                    }
                }
            }

            progress.report(SyncProgressEvent::Fetching {
                account: account_id.to_string(),
                page,
                listed,
                stored: summary.fetched,
            });

            match listing.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Four-mode parse driver
    // ═══════════════════════════════════════════════════════════════════

    /// The single driver behind every parse mode; behaviour comes only from
    /// [`ParseMode::strategy`]. Never fails: infrastructure errors are
    /// recorded as the summary's abort reason.
    async fn run_parse(
        &self,
        account_id: &str,
        mode: ParseMode,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
    ) -> RunSummary {
        let mut summary = RunSummary::new(account_id, format!("parse:{}", mode));
        if let Err(e) = self
            .drive(account_id, mode, cancel, progress, &mut summary)
            .await
        {
            warn!(account = account_id, %mode, error = %format!("{:#}", e), "parse aborted");
            summary.abort(&e);
        }
        summary
    }

    async fn drive(
        &self,
        account_id: &str,
        mode: ParseMode,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let strategy = mode.strategy();
        let rules = self.store.list_rules().await?;
        let engine = ParseEngine::new(&rules);
        for issue in engine.rule_issues() {
            warn!(rule = %issue.rule_name, error = %issue.error, "rule skipped");
        }

        if let Some(reset) = &strategy.reset {
            for message in self.store.select_messages(account_id, reset).await? {
                self.store
                    .set_parse_state(&message.id, ParseState::Unparsed, None, None)
                    .await?;
                summary.reset += 1;
            }
            if summary.reset > 0 {
                info!(account = account_id, reset = summary.reset, "orphaned messages reset");
            }
        }

        let messages = self
            .store
            .select_messages(account_id, &strategy.selection)
            .await?;
        let total = messages.len() as u64;
        debug!(account = account_id, %mode, total, "parse pass selected messages");

        for message in &messages {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            summary.processed += 1;
            self.process(&engine, message, strategy.write, summary)
                .await?;

            if summary.processed % PROGRESS_EVERY == 0 || summary.processed == total {
                progress.report(SyncProgressEvent::Parsing {
                    account: account_id.to_string(),
                    mode: mode.to_string(),
                    n: summary.processed,
                    total,
                });
            }
        }
        Ok(())
    }

    /// Parse one message and apply the write policy. `Err` is reserved for
    /// store failures.
    async fn process(
        &self,
        engine: &ParseEngine,
        message: &Message,
        write: WritePolicy,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let outcome = engine.parse(message);
        let rule_id = outcome.rule_id.as_deref();

        let fields = match &outcome.result {
            Ok(fields) => fields,
            Err(failure) => {
                // A failed re-attempt never downgrades an earlier success.
                if message.parse_state != ParseState::ParsedOk {
                    self.store
                        .set_parse_state(
                            &message.id,
                            ParseState::ParsedError,
                            Some(&failure.to_string()),
                            rule_id,
                        )
                        .await?;
                }
                summary.record_failure(&message.id, failure.code(), failure.to_string());
                return Ok(());
            }
        };

        if write == WritePolicy::SkipIfExisting
            && self.store.count_transactions_for_message(&message.id).await? > 0
        {
            if message.parse_state != ParseState::ParsedOk {
                self.store
                    .set_parse_state(&message.id, ParseState::ParsedOk, None, rule_id)
                    .await?;
            }
            summary.skipped += 1;
            return Ok(());
        }

        let card = match &fields.card_suffix {
            Some(suffix) => self.store.find_card_by_suffix(suffix).await?,
            None => None,
        };

        let txn = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: message.account_id.clone(),
            amount: fields.amount,
            merchant: fields.merchant.clone(),
            description: fields.description.clone(),
            date: fields.date,
            source: TransactionSource::Email,
            message_id: Some(message.id.clone()),
            rule_id: outcome.rule_id.clone(),
            card_id: card.as_ref().map(|c| c.id.clone()),
            owner: card.and_then(|c| c.owner),
            created_at: Utc::now(),
        };

        // State before the transaction: an interruption between the two
        // leaves an orphan for smart-full to repair.
        self.store
            .set_parse_state(&message.id, ParseState::ParsedOk, None, rule_id)
            .await?;
        self.store.insert_transaction(&txn).await?;
        summary.succeeded += 1;

        if let Some(rule_id) = rule_id {
            if let Err(e) = self.store.record_rule_hit(rule_id).await {
                warn!(rule = rule_id, error = %e, "failed to record rule hit");
            }
        }
        Ok(())
    }
}
