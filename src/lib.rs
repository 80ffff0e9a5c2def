//! # Inbox Ledger
//!
//! Turns bank and card alert emails into a ledger of structured
//! transactions.
//!
//! Mail accounts are connected over OAuth. Alert messages are fetched
//! idempotently into SQLite, matched against user-defined rules, and parsed
//! into transactions. Batches run in one of four modes so the ledger can be
//! repaired or rebuilt after rule changes without losing data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────┐
//! │  Mailbox    │──▶│ SyncOrchestrator │──▶│  SQLite  │
//! │ (Gmail API) │   │ fetch + 4 modes  │   │  Store   │
//! └─────────────┘   └────────┬─────────┘   └──────────┘
//!        ▲                   │ ParseEngine (inbox-ledger-core)
//!  ┌─────┴──────┐            │
//!  │ TokenVault │      ┌─────┴──────┬──────────────┐
//!  │  (OAuth)   │      ▼            ▼              ▼
//!  └────────────┘  ┌───────┐   ┌──────────┐   ┌───────────┐
//!                  │  CLI  │   │   HTTP   │   │ /cron/sync│
//!                  │ (ibl) │   │  (axum)  │   │ scheduler │
//!                  └───────┘   └──────────┘   └───────────┘
//! ```
//!
//! The parse pipeline itself (rules, extraction, dates, audit) lives in the
//! I/O-free `inbox-ledger-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | `Store` implementation over SQLite |
//! | [`traits`] | `Mailbox` and `OAuthClient` seams, external error classes |
//! | [`mailbox`] | Gmail REST client with retry |
//! | [`retry`] | Backoff shared by the HTTP clients |
//! | [`oauth`] | Google token endpoint client |
//! | [`token_vault`] | Access-token lifetime per account |
//! | [`ingest`] | Fetch sub-flow and the four-mode parse driver |
//! | [`batch_guard`] | One batch per account at a time |
//! | [`progress`] | Progress reporting on stderr |
//! | [`server`] | HTTP API and scheduler trigger |

pub mod accounts;
pub mod app;
pub mod batch_guard;
pub mod config;
pub mod db;
pub mod ingest;
pub mod mailbox;
pub mod migrate;
pub mod oauth;
pub mod progress;
pub mod report;
pub mod retry;
pub mod rules_cmd;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod token_vault;
pub mod traits;
