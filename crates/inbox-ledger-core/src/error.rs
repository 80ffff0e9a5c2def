//! Error taxonomy.
//!
//! [`ParseFailure`] is the per-message outcome recorded on a message when
//! parsing does not produce a transaction; it never aborts a batch.
//! [`LedgerError`] covers rule-level and infrastructure-level conditions.
//! It travels inside `anyhow::Error` through the application crate and is
//! recovered with [`LedgerError::find`] where callers need to branch on it
//! (most importantly [`LedgerError::ReauthorizationRequired`]).

use thiserror::Error;

/// Why a single message did not yield a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("no matching rule")]
    NoMatchingRule,
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("no determinable date")]
    DateUnresolvable,
}

impl ParseFailure {
    /// Stable machine-readable code, used in run summaries and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            ParseFailure::NoMatchingRule => "no_matching_rule",
            ParseFailure::ExtractionFailed(_) => "extraction_failed",
            ParseFailure::DateUnresolvable => "date_unresolvable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("rule '{rule}' has an invalid {field} pattern: {message}")]
    InvalidRulePattern {
        rule: String,
        field: &'static str,
        message: String,
    },
    #[error("external API failure: {0}")]
    ExternalApi(String),
    #[error("account '{account_id}' must be reconnected: {reason}")]
    ReauthorizationRequired { account_id: String, reason: String },
    #[error("account '{0}' is not connected")]
    AccountDisconnected(String),
    #[error("account '{0}' not found")]
    AccountNotFound(String),
    #[error("a batch is already running for account '{0}'")]
    BatchInProgress(String),
}

impl LedgerError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidRulePattern { .. } => "invalid_rule_pattern",
            LedgerError::ExternalApi(_) => "external_api_failure",
            LedgerError::ReauthorizationRequired { .. } => "reauthorization_required",
            LedgerError::AccountDisconnected(_) => "account_disconnected",
            LedgerError::AccountNotFound(_) => "not_found",
            LedgerError::BatchInProgress(_) => "conflict",
        }
    }

    /// Find a `LedgerError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&LedgerError> {
        err.chain().find_map(|cause| cause.downcast_ref::<LedgerError>())
    }

    pub fn is_reauthorization(err: &anyhow::Error) -> bool {
        matches!(
            Self::find(err),
            Some(LedgerError::ReauthorizationRequired { .. })
        )
    }
}
