//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are unix milliseconds. Amounts are stored as decimal TEXT so no
//! precision is lost. Transaction dates keep their precision in a separate
//! `date_precision` column (`date` for calendar days, `datetime` for
//! mailbox receipt instants).

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use inbox_ledger_core::store::{MessageLink, Store};
use inbox_ledger_core::{
    Card, Message, MessageSelection, ParseState, Rule, SyncState, Transaction, TransactionDate,
    TransactionSource,
};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const MESSAGE_COLUMNS: &str = "id, account_id, external_id, sender, subject, body, received_at, \
     parse_state, parse_error, rule_id, content_hash, created_at";

const RULE_COLUMNS: &str = "id, name, is_active, priority, created_seq, sender_pattern, \
     subject_pattern, body_pattern, amount_pattern, merchant_pattern, date_pattern, card_pattern, \
     description_pattern, date_format, hit_count";

fn from_ts(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("timestamp out of range: {}", millis))
}

fn from_opt_ts(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(from_ts).transpose()
}

fn date_columns(date: &TransactionDate) -> (i64, &'static str) {
    match date {
        TransactionDate::Day(day) => (
            day.and_time(NaiveTime::MIN).and_utc().timestamp_millis(),
            "date",
        ),
        TransactionDate::Instant(ts) => (ts.timestamp_millis(), "datetime"),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let state: String = row.try_get("parse_state")?;
    Ok(Message {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        external_id: row.try_get("external_id")?,
        sender: row.try_get("sender")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        received_at: from_opt_ts(row.try_get("received_at")?)?,
        parse_state: ParseState::from_str(&state).map_err(|e| anyhow!(e))?,
        parse_error: row.try_get("parse_error")?,
        rule_id: row.try_get("rule_id")?,
        content_hash: row.try_get("content_hash")?,
        created_at: from_ts(row.try_get("created_at")?)?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<Transaction> {
    let amount: String = row.try_get("amount")?;
    let occurred_at = from_ts(row.try_get("occurred_at")?)?;
    let precision: String = row.try_get("date_precision")?;
    let date = match precision.as_str() {
        "date" => TransactionDate::Day(occurred_at.date_naive()),
        _ => TransactionDate::Instant(occurred_at),
    };
    let source: String = row.try_get("source")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: Decimal::from_str(&amount)
            .with_context(|| format!("Invalid stored amount: {}", amount))?,
        merchant: row.try_get("merchant")?,
        description: row.try_get("description")?,
        date,
        source: TransactionSource::from_str(&source).map_err(|e| anyhow!(e))?,
        message_id: row.try_get("message_id")?,
        rule_id: row.try_get("rule_id")?,
        card_id: row.try_get("card_id")?,
        owner: row.try_get("owner")?,
        created_at: from_ts(row.try_get("created_at")?)?,
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<Rule> {
    Ok(Rule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        priority: row.try_get("priority")?,
        created_seq: row.try_get("created_seq")?,
        sender_pattern: row.try_get("sender_pattern")?,
        subject_pattern: row.try_get("subject_pattern")?,
        body_pattern: row.try_get("body_pattern")?,
        amount_pattern: row.try_get("amount_pattern")?,
        merchant_pattern: row.try_get("merchant_pattern")?,
        date_pattern: row.try_get("date_pattern")?,
        card_pattern: row.try_get("card_pattern")?,
        description_pattern: row.try_get("description_pattern")?,
        date_format: row.try_get("date_format")?,
        hit_count: row.try_get("hit_count")?,
    })
}

fn sync_state_from_row(row: &SqliteRow) -> Result<SyncState> {
    Ok(SyncState {
        account_id: row.try_get("account_id")?,
        email: row.try_get("email")?,
        label: row.try_get("label")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        token_expires_at: from_opt_ts(row.try_get("token_expires_at")?)?,
        last_sync_at: from_opt_ts(row.try_get("last_sync_at")?)?,
        connected: row.try_get::<i64, _>("connected")? != 0,
        created_at: from_ts(row.try_get("created_at")?)?,
    })
}

fn card_from_row(row: &SqliteRow) -> Result<Card> {
    Ok(Card {
        id: row.try_get("id")?,
        suffix: row.try_get("suffix")?,
        label: row.try_get("label")?,
        owner: row.try_get("owner")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_sync_state(&self, state: &SyncState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_states (account_id, email, label, access_token, refresh_token,
                                     token_expires_at, last_sync_at, connected, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                email = excluded.email,
                label = excluded.label,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_expires_at = excluded.token_expires_at,
                last_sync_at = excluded.last_sync_at,
                connected = excluded.connected
            "#,
        )
        .bind(&state.account_id)
        .bind(&state.email)
        .bind(&state.label)
        .bind(&state.access_token)
        .bind(&state.refresh_token)
        .bind(state.token_expires_at.map(|t| t.timestamp_millis()))
        .bind(state.last_sync_at.map(|t| t.timestamp_millis()))
        .bind(state.connected as i64)
        .bind(state.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_sync_state(&self, account_id: &str) -> Result<Option<SyncState>> {
        let row = sqlx::query("SELECT * FROM sync_states WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(sync_state_from_row).transpose()
    }

    async fn list_sync_states(&self) -> Result<Vec<SyncState>> {
        let rows = sqlx::query("SELECT * FROM sync_states ORDER BY account_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(sync_state_from_row).collect()
    }

    async fn update_tokens(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_states SET
                access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                token_expires_at = ?,
                connected = 1
            WHERE account_id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at.timestamp_millis())
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("unknown account: {}", account_id));
        }
        Ok(())
    }

    async fn disconnect(&self, account_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_states SET
                access_token = NULL,
                refresh_token = NULL,
                token_expires_at = NULL,
                connected = 0
            WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_last_sync(&self, account_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sync_states SET last_sync_at = ? WHERE account_id = ?")
            .bind(at.timestamp_millis())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn message_exists(&self, account_id: &str, external_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM messages WHERE account_id = ? AND external_id = ?",
        )
        .bind(account_id)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_message(&self, message: &Message) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, account_id, external_id, sender, subject, body,
                                  received_at, parse_state, parse_error, rule_id,
                                  content_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, external_id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.account_id)
        .bind(&message.external_id)
        .bind(&message.sender)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(message.received_at.map(|t| t.timestamp_millis()))
        .bind(message.parse_state.as_str())
        .bind(&message.parse_error)
        .bind(&message.rule_id)
        .bind(&message.content_hash)
        .bind(message.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn select_messages(
        &self,
        account_id: &str,
        selection: &MessageSelection,
    ) -> Result<Vec<Message>> {
        let filter = match selection {
            MessageSelection::Unparsed => "AND parse_state = 'unparsed'".to_string(),
            MessageSelection::Orphaned => "AND parse_state = 'parsed_ok' AND NOT EXISTS \
                 (SELECT 1 FROM transactions t WHERE t.message_id = messages.id)"
                .to_string(),
            MessageSelection::All => String::new(),
            MessageSelection::Ids(ids) if ids.is_empty() => return Ok(Vec::new()),
            MessageSelection::Ids(ids) => {
                format!("AND id IN ({})", vec!["?"; ids.len()].join(", "))
            }
        };
        let sql = format!(
            "SELECT {} FROM messages WHERE account_id = ? {} ORDER BY received_at ASC, rowid ASC",
            MESSAGE_COLUMNS, filter
        );

        let mut query = sqlx::query(&sql).bind(account_id);
        if let MessageSelection::Ids(ids) = selection {
            for id in ids {
                query = query.bind(id);
            }
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn set_parse_state(
        &self,
        message_id: &str,
        state: ParseState,
        error: Option<&str>,
        rule_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET parse_state = ?, parse_error = ?, rule_id = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(error)
        .bind(rule_id)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_transaction(&self, txn: &Transaction) -> Result<()> {
        let (occurred_at, precision) = date_columns(&txn.date);
        sqlx::query(
            r#"
            INSERT INTO transactions (id, account_id, amount, merchant, description,
                                      occurred_at, date_precision, source, message_id,
                                      rule_id, card_id, owner, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&txn.id)
        .bind(&txn.account_id)
        .bind(txn.amount.to_string())
        .bind(&txn.merchant)
        .bind(&txn.description)
        .bind(occurred_at)
        .bind(precision)
        .bind(txn.source.as_str())
        .bind(&txn.message_id)
        .bind(&txn.rule_id)
        .bind(&txn.card_id)
        .bind(&txn.owner)
        .bind(txn.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_transactions_for_message(&self, message_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE message_id = ?")
            .bind(message_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_transactions(&self, account_id: &str) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE account_id = ? ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn delete_transaction(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transactions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<Rule> {
        let created_seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rules (id, name, is_active, priority, created_seq, sender_pattern,
                               subject_pattern, body_pattern, amount_pattern, merchant_pattern,
                               date_pattern, card_pattern, description_pattern, date_format,
                               hit_count)
            VALUES (?, ?, ?, ?, (SELECT COALESCE(MAX(created_seq), 0) + 1 FROM rules),
                    ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING created_seq
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(rule.is_active as i64)
        .bind(rule.priority)
        .bind(&rule.sender_pattern)
        .bind(&rule.subject_pattern)
        .bind(&rule.body_pattern)
        .bind(&rule.amount_pattern)
        .bind(&rule.merchant_pattern)
        .bind(&rule.date_pattern)
        .bind(&rule.card_pattern)
        .bind(&rule.description_pattern)
        .bind(&rule.date_format)
        .bind(rule.hit_count)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to insert rule '{}'", rule.name))?;

        let mut stored = rule.clone();
        stored.created_seq = created_seq;
        Ok(stored)
    }

    async fn list_rules(&self) -> Result<Vec<Rule>> {
        let sql = format!(
            "SELECT {} FROM rules ORDER BY priority DESC, created_seq DESC, id ASC",
            RULE_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn record_rule_hit(&self, rule_id: &str) -> Result<()> {
        sqlx::query("UPDATE rules SET hit_count = hit_count + 1 WHERE id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_card(&self, card: &Card) -> Result<()> {
        sqlx::query("INSERT INTO cards (id, suffix, label, owner) VALUES (?, ?, ?, ?)")
            .bind(&card.id)
            .bind(&card.suffix)
            .bind(&card.label)
            .bind(&card.owner)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to add card ending in {}", card.suffix))?;
        Ok(())
    }

    async fn find_card_by_suffix(&self, suffix: &str) -> Result<Option<Card>> {
        let row = sqlx::query("SELECT id, suffix, label, owner FROM cards WHERE suffix = ?")
            .bind(suffix)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn message_links(&self, account_id: &str) -> Result<Vec<MessageLink>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.external_id, m.subject, m.parse_state, m.parse_error, m.rule_id,
                   (SELECT COUNT(*) FROM transactions t WHERE t.message_id = m.id) AS txn_count
            FROM messages m
            WHERE m.account_id = ?
            ORDER BY m.received_at ASC, m.rowid ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let state: String = row.try_get("parse_state")?;
                Ok(MessageLink {
                    message_id: row.try_get("id")?,
                    external_id: row.try_get("external_id")?,
                    subject: row.try_get("subject")?,
                    parse_state: ParseState::from_str(&state).map_err(|e| anyhow!(e))?,
                    parse_error: row.try_get("parse_error")?,
                    rule_id: row.try_get("rule_id")?,
                    transaction_count: row.try_get("txn_count")?,
                })
            })
            .collect()
    }

    async fn try_acquire_batch_lease(
        &self,
        account_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        // The conflict branch only takes over a stale lease, so a fresh one
        // leaves zero rows affected.
        let result = sqlx::query(
            r#"
            INSERT INTO batch_leases (account_id, holder, renewed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                holder = excluded.holder,
                renewed_at = excluded.renewed_at
            WHERE batch_leases.renewed_at < ?
            "#,
        )
        .bind(account_id)
        .bind(holder)
        .bind(now.timestamp_millis())
        .bind(stale_before.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew_batch_lease(
        &self,
        account_id: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE batch_leases SET renewed_at = ? WHERE account_id = ? AND holder = ?")
            .bind(now.timestamp_millis())
            .bind(account_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_batch_lease(&self, account_id: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM batch_leases WHERE account_id = ? AND holder = ?")
            .bind(account_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
