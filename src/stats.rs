//! Database statistics overview for `ibl stats`.
//!
//! Per-account message counts by parse state, transaction counts, and the
//! last completed sync. A quick way to see whether syncs are landing and
//! how big the unparsed backlog is.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

struct AccountStats {
    account_id: String,
    connected: bool,
    messages: i64,
    unparsed: i64,
    parsed_ok: i64,
    parsed_error: i64,
    transactions: i64,
    last_sync_ts: Option<i64>,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&pool)
        .await?;
    let total_transactions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions")
        .fetch_one(&pool)
        .await?;
    let active_rules: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rules WHERE is_active = 1")
        .fetch_one(&pool)
        .await?;
    let total_rules: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rules")
        .fetch_one(&pool)
        .await?;
    let cards: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cards")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Inbox Ledger: Database Stats");
    println!("=============================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Messages:      {}", total_messages);
    println!("  Transactions:  {}", total_transactions);
    println!("  Rules:         {} active / {}", active_rules, total_rules);
    println!("  Cards:         {}", cards);

    let rows = sqlx::query(
        r#"
        SELECT
            s.account_id,
            s.connected,
            s.last_sync_at,
            (SELECT COUNT(*) FROM messages m WHERE m.account_id = s.account_id) AS messages,
            (SELECT COUNT(*) FROM messages m
                WHERE m.account_id = s.account_id AND m.parse_state = 'unparsed') AS unparsed,
            (SELECT COUNT(*) FROM messages m
                WHERE m.account_id = s.account_id AND m.parse_state = 'parsed_ok') AS parsed_ok,
            (SELECT COUNT(*) FROM messages m
                WHERE m.account_id = s.account_id AND m.parse_state = 'parsed_error') AS parsed_error,
            (SELECT COUNT(*) FROM transactions t WHERE t.account_id = s.account_id) AS transactions
        FROM sync_states s
        ORDER BY s.account_id
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let accounts: Vec<AccountStats> = rows
        .iter()
        .map(|row| AccountStats {
            account_id: row.get("account_id"),
            connected: row.get::<i64, _>("connected") != 0,
            messages: row.get("messages"),
            unparsed: row.get("unparsed"),
            parsed_ok: row.get("parsed_ok"),
            parsed_error: row.get("parsed_error"),
            transactions: row.get("transactions"),
            last_sync_ts: row
                .get::<Option<i64>, _>("last_sync_at")
                .map(|millis| millis / 1000),
        })
        .collect();

    if !accounts.is_empty() {
        println!();
        println!("  By account:");
        println!(
            "  {:<18} {:>4} {:>7} {:>8} {:>6} {:>6} {:>6}   {}",
            "ACCOUNT", "CONN", "MSGS", "UNPARSED", "OK", "ERROR", "TXNS", "LAST SYNC"
        );
        println!("  {}", "-".repeat(80));

        for a in &accounts {
            let sync_display = match a.last_sync_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<18} {:>4} {:>7} {:>8} {:>6} {:>6} {:>6}   {}",
                a.account_id,
                if a.connected { "yes" } else { "no" },
                a.messages,
                a.unparsed,
                a.parsed_ok,
                a.parsed_error,
                a.transactions,
                sync_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanised() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 2 * 3600), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }
}
