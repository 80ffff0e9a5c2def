//! # Inbox Ledger Core
//!
//! Shared, I/O-free logic for Inbox Ledger: data models, rule compilation
//! and matching, field extraction, date resolution, the parse engine, the
//! batch-mode table, the store abstraction, and the integrity auditor.
//!
//! This crate contains no tokio, sqlx, HTTP client, or filesystem I/O.
//! Everything here is deterministic given its inputs; the application
//! crate wires it to SQLite, the mailbox API, and the OAuth endpoint.
//!
//! ## Parse pipeline
//!
//! ```text
//! Message ──▶ RuleSet::select ──▶ extract ──▶ resolve_date ──▶ ParseOutcome
//!             (priority order)    (amount      (body date, else
//!                                  mandatory)   received-at)
//! ```

pub mod audit;
pub mod dates;
pub mod engine;
pub mod error;
pub mod extract;
pub mod mode;
pub mod models;
pub mod rules;
pub mod store;
pub mod summary;

pub use audit::{audit_account, AuditReport, Finding};
pub use engine::{parse, ParseEngine};
pub use error::{LedgerError, ParseFailure};
pub use mode::{MessageSelection, ModeStrategy, ParseMode, WritePolicy};
pub use models::{
    Card, Message, ParseOutcome, ParseState, ParsedFields, RawMessage, Rule, SyncState,
    Transaction, TransactionDate, TransactionSource,
};
pub use rules::{CompiledRule, RuleIssue, RuleSet};
pub use store::{memory::InMemoryStore, MessageLink, Store};
pub use summary::{ItemFailure, RunAbort, RunSummary};
