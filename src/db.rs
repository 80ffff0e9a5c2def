//! SQLite connection pool.
//!
//! The CLI, the HTTP server and scheduled runs may all hold the same file
//! open at once. WAL lets readers proceed while a batch writes, and the
//! busy timeout makes a writer wait out another process's lock instead of
//! failing with `SQLITE_BUSY`.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::config::Config;

/// Open (creating if needed) the configured database.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db = &config.db;

    if let Some(parent) = db.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&db.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(db.busy_timeout_ms));

    SqlitePoolOptions::new()
        .max_connections(db.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db.path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[tokio::test]
    async fn creates_missing_directories_and_uses_wal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested/data/ledger.sqlite");
        let config = parse_config(&format!(
            "[db]\npath = \"{}\"\nbusy_timeout_ms = 250\n",
            path.display()
        ))
        .unwrap();

        let pool = connect(&config).await.unwrap();
        assert!(path.exists());

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode, "wal");
        let timeout: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(timeout, 250);
        pool.close().await;
    }
}
