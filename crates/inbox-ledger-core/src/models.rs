//! Core data models used throughout Inbox Ledger.
//!
//! These types represent the messages, rules, transactions, and per-account
//! sync state that flow through the ingestion and parsing pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ParseFailure;

/// Raw message as returned by the mailbox API, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub external_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: Option<DateTime<Utc>>,
}

/// Parse lifecycle of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseState {
    Unparsed,
    ParsedOk,
    ParsedError,
}

impl ParseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseState::Unparsed => "unparsed",
            ParseState::ParsedOk => "parsed_ok",
            ParseState::ParsedError => "parsed_error",
        }
    }
}

impl fmt::Display for ParseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParseState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unparsed" => Ok(ParseState::Unparsed),
            "parsed_ok" => Ok(ParseState::ParsedOk),
            "parsed_error" => Ok(ParseState::ParsedError),
            other => Err(format!("unknown parse state: '{}'", other)),
        }
    }
}

/// An ingested notification stored for parsing.
///
/// Created once per `(account_id, external_id)`. Afterwards only
/// `parse_state`, `parse_error` and `rule_id` change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub account_id: String,
    pub external_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: Option<DateTime<Utc>>,
    pub parse_state: ParseState,
    pub parse_error: Option<String>,
    pub rule_id: Option<String>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a new, unparsed message record from a mailbox item.
    pub fn from_raw(account_id: &str, raw: RawMessage) -> Self {
        let content_hash = content_hash(&raw.sender, &raw.subject, &raw.body);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            external_id: raw.external_id,
            sender: raw.sender,
            subject: raw.subject,
            body: raw.body,
            received_at: raw.received_at,
            parse_state: ParseState::Unparsed,
            parse_error: None,
            rule_id: None,
            content_hash,
            created_at: Utc::now(),
        }
    }
}

/// SHA-256 over sender, subject and body, hex-encoded.
pub fn content_hash(sender: &str, subject: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update([0u8]);
    hasher.update(subject.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// A user-authored matching and extraction rule.
///
/// Patterns are stored as plain strings and compiled at load time by
/// [`RuleSet`](crate::rules::RuleSet). An empty string is the same as an
/// unset pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default = "generate_id")]
    pub id: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i64,
    /// Insertion sequence assigned by the store. Breaks priority ties:
    /// the most recently created rule is evaluated first.
    #[serde(default)]
    pub created_seq: i64,
    #[serde(default)]
    pub sender_pattern: Option<String>,
    #[serde(default)]
    pub subject_pattern: Option<String>,
    #[serde(default)]
    pub body_pattern: Option<String>,
    pub amount_pattern: String,
    #[serde(default)]
    pub merchant_pattern: Option<String>,
    #[serde(default)]
    pub date_pattern: Option<String>,
    #[serde(default)]
    pub card_pattern: Option<String>,
    #[serde(default)]
    pub description_pattern: Option<String>,
    /// chrono format string for the date capture, e.g. `%d/%m/%Y`.
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default)]
    pub hit_count: i64,
}

fn default_active() -> bool {
    true
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Rule {
    /// A minimal active rule with only an amount pattern.
    pub fn new(name: &str, amount_pattern: &str) -> Self {
        Self {
            id: generate_id(),
            name: name.to_string(),
            is_active: true,
            priority: 0,
            created_seq: 0,
            sender_pattern: None,
            subject_pattern: None,
            body_pattern: None,
            amount_pattern: amount_pattern.to_string(),
            merchant_pattern: None,
            date_pattern: None,
            card_pattern: None,
            description_pattern: None,
            date_format: None,
            hit_count: 0,
        }
    }
}

/// Where a transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    Email,
    Manual,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSource::Email => "email",
            TransactionSource::Manual => "manual",
        }
    }
}

impl FromStr for TransactionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(TransactionSource::Email),
            "manual" => Ok(TransactionSource::Manual),
            other => Err(format!("unknown transaction source: '{}'", other)),
        }
    }
}

/// Authoritative transaction date.
///
/// Dates pulled out of a message body carry calendar precision only; the
/// mailbox receipt time keeps its full precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "precision", content = "value", rename_all = "snake_case")]
pub enum TransactionDate {
    Day(NaiveDate),
    Instant(DateTime<Utc>),
}

impl TransactionDate {
    pub fn day(&self) -> NaiveDate {
        match self {
            TransactionDate::Day(d) => *d,
            TransactionDate::Instant(ts) => ts.date_naive(),
        }
    }
}

impl fmt::Display for TransactionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionDate::Day(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            TransactionDate::Instant(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%SZ")),
        }
    }
}

/// A structured financial record, derived from a message or entered manually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    pub amount: Decimal,
    pub merchant: Option<String>,
    pub description: Option<String>,
    pub date: TransactionDate,
    pub source: TransactionSource,
    pub message_id: Option<String>,
    pub rule_id: Option<String>,
    pub card_id: Option<String>,
    /// Copied from the card when the transaction is created; never
    /// re-synchronised afterwards.
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A company card, looked up by the last digits printed in alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub suffix: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Per-account connection and token state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub account_id: String,
    pub email: String,
    /// Mailbox label that alerts are pulled from.
    pub label: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
}

impl SyncState {
    /// A registered but not yet connected account.
    pub fn new(account_id: &str, email: &str, label: Option<String>) -> Self {
        Self {
            account_id: account_id.to_string(),
            email: email.to_string(),
            label,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            last_sync_at: None,
            connected: false,
            created_at: Utc::now(),
        }
    }
}

/// Fields produced by a successful parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedFields {
    pub amount: Decimal,
    pub merchant: Option<String>,
    pub description: Option<String>,
    /// Normalised card suffix (three-digit captures are padded to four).
    pub card_suffix: Option<String>,
    /// The raw date capture, kept for diagnostics.
    pub raw_date: Option<String>,
    pub date: TransactionDate,
}

/// Result of running the parse engine over one message. Never persisted.
///
/// `rule_id` is set whenever a rule was selected, including when
/// extraction or date resolution then failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome {
    pub rule_id: Option<String>,
    pub result: Result<ParsedFields, ParseFailure>,
}

impl ParseOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn fields(&self) -> Option<&ParsedFields> {
        self.result.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&ParseFailure> {
        self.result.as_ref().err()
    }
}

impl Serialize for ParseOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("ParseOutcome", 5)?;
        s.serialize_field("success", &self.is_success())?;
        s.serialize_field("fields", &self.fields())?;
        s.serialize_field("error_code", &self.failure().map(|f| f.code()))?;
        s.serialize_field("error", &self.failure().map(|f| f.to_string()))?;
        s.serialize_field("rule_id", &self.rule_id)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_state_round_trips_through_str() {
        for state in [
            ParseState::Unparsed,
            ParseState::ParsedOk,
            ParseState::ParsedError,
        ] {
            assert_eq!(state.as_str().parse::<ParseState>().unwrap(), state);
        }
        assert!("done".parse::<ParseState>().is_err());
    }

    #[test]
    fn content_hash_separates_fields() {
        assert_ne!(content_hash("ab", "c", ""), content_hash("a", "bc", ""));
    }

    #[test]
    fn outcome_serializes_failure_code() {
        let outcome = ParseOutcome {
            rule_id: None,
            result: Err(ParseFailure::NoMatchingRule),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "no_matching_rule");
        assert!(json["fields"].is_null());
    }
}
