//! Run summaries returned by every batch entry point.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::LedgerError;

/// One failed item in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    /// Message id for parse failures, external id for fetch failures.
    pub item_id: String,
    pub code: String,
    pub reason: String,
}

/// Why a run stopped before processing every selected item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RunAbort {
    ReauthorizationRequired { message: String },
    ExternalApiFailure { message: String },
    /// Another batch already holds the account.
    Conflict { message: String },
    /// The account vanished or was disconnected mid-run.
    AccountUnavailable { message: String },
    StoreFailure { message: String },
}

impl RunAbort {
    /// Classify an infrastructure error that ended a run.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        match LedgerError::find(err) {
            Some(LedgerError::ReauthorizationRequired { .. }) => {
                RunAbort::ReauthorizationRequired { message }
            }
            Some(LedgerError::ExternalApi(_)) => RunAbort::ExternalApiFailure { message },
            Some(LedgerError::BatchInProgress(_)) => RunAbort::Conflict { message },
            Some(LedgerError::AccountDisconnected(_)) | Some(LedgerError::AccountNotFound(_)) => {
                RunAbort::AccountUnavailable { message }
            }
            _ => RunAbort::StoreFailure { message },
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RunAbort::ReauthorizationRequired { message }
            | RunAbort::ExternalApiFailure { message }
            | RunAbort::Conflict { message }
            | RunAbort::AccountUnavailable { message }
            | RunAbort::StoreFailure { message } => message,
        }
    }
}

/// Counts and per-item failures for one run over one account.
///
/// `aborted` is set when an infrastructure failure ended the run early;
/// the counts still reflect everything committed before that point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub account_id: String,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// New messages stored by the fetch sub-flow.
    pub fetched: u64,
    /// Mailbox items already stored for the account.
    pub already_present: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Items intentionally not written (existing transaction).
    pub skipped: u64,
    /// Messages reset to `unparsed` by a repair pass.
    pub reset: u64,
    pub failures: Vec<ItemFailure>,
    pub cancelled: bool,
    pub aborted: Option<RunAbort>,
}

impl RunSummary {
    pub fn new(account_id: &str, operation: impl Into<String>) -> Self {
        Self {
            account_id: account_id.to_string(),
            operation: operation.into(),
            started_at: Utc::now(),
            finished_at: None,
            fetched: 0,
            already_present: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            reset: 0,
            failures: Vec::new(),
            cancelled: false,
            aborted: None,
        }
    }

    pub fn record_failure(&mut self, item_id: &str, code: &str, reason: impl Into<String>) {
        self.failed += 1;
        self.failures.push(ItemFailure {
            item_id: item_id.to_string(),
            code: code.to_string(),
            reason: reason.into(),
        });
    }

    pub fn abort(&mut self, err: &anyhow::Error) {
        self.aborted = Some(RunAbort::from_error(err));
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    /// True when the run ended because the account must be reconnected.
    pub fn needs_reauthorization(&self) -> bool {
        matches!(self.aborted, Some(RunAbort::ReauthorizationRequired { .. }))
    }

    /// Fold the counts of a follow-up pass (e.g. the parse after a fetch)
    /// into this summary.
    pub fn absorb(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.reset += other.reset;
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
        if self.aborted.is_none() {
            self.aborted = other.aborted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_classifies_reauthorization() {
        let err = anyhow::Error::from(LedgerError::ReauthorizationRequired {
            account_id: "a".into(),
            reason: "revoked".into(),
        });
        let mut summary = RunSummary::new("a", "sync");
        summary.abort(&err);
        assert!(summary.needs_reauthorization());
    }

    #[test]
    fn untyped_errors_are_store_failures() {
        let err = anyhow::anyhow!("database is locked");
        assert!(matches!(
            RunAbort::from_error(&err),
            RunAbort::StoreFailure { .. }
        ));
    }

    #[test]
    fn absorb_keeps_first_abort() {
        let mut first = RunSummary::new("a", "sync");
        first.fetched = 2;
        let mut second = RunSummary::new("a", "parse:quick");
        second.processed = 2;
        second.record_failure("m1", "no_matching_rule", "no matching rule");
        first.absorb(second);
        assert_eq!(first.fetched, 2);
        assert_eq!(first.processed, 2);
        assert_eq!(first.failed, 1);
        assert_eq!(first.failures[0].item_id, "m1");
    }
}
