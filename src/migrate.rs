//! Schema creation. Every statement is idempotent, so `ibl init` can be
//! re-run safely against an existing database. INTEGER `*_at` columns
//! hold unix milliseconds.

use anyhow::Result;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_states (
        account_id TEXT PRIMARY KEY,
        email TEXT NOT NULL,
        label TEXT,
        access_token TEXT,
        refresh_token TEXT,
        token_expires_at INTEGER,
        last_sync_at INTEGER,
        connected INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        external_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        received_at INTEGER,
        parse_state TEXT NOT NULL DEFAULT 'unparsed',
        parse_error TEXT,
        rule_id TEXT,
        content_hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(account_id, external_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        amount TEXT NOT NULL,
        merchant TEXT,
        description TEXT,
        occurred_at INTEGER NOT NULL,
        date_precision TEXT NOT NULL,
        source TEXT NOT NULL,
        message_id TEXT,
        rule_id TEXT,
        card_id TEXT,
        owner TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rules (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        priority INTEGER NOT NULL DEFAULT 0,
        created_seq INTEGER NOT NULL UNIQUE,
        sender_pattern TEXT,
        subject_pattern TEXT,
        body_pattern TEXT,
        amount_pattern TEXT NOT NULL,
        merchant_pattern TEXT,
        date_pattern TEXT,
        card_pattern TEXT,
        description_pattern TEXT,
        date_format TEXT,
        hit_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cards (
        id TEXT PRIMARY KEY,
        suffix TEXT NOT NULL UNIQUE,
        label TEXT,
        owner TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batch_leases (
        account_id TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        renewed_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_state ON messages(account_id, parse_state)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_message ON transactions(message_id)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }

    pool.close().await;
    Ok(())
}
