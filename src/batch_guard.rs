//! At most one in-flight batch per account, across every process that
//! shares the database.
//!
//! `full-reparse` checks for an existing transaction and then inserts; the
//! two steps are not atomic, so two concurrent passes over one account
//! could both insert. A CLI run and the server's scheduled sync are
//! separate processes, so the claim lives in the store as a lease row.
//!
//! A lease is renewed by a heartbeat while the batch runs. A process that
//! dies without releasing leaves a lease that goes stale after
//! `lease_ttl`, after which the next batch takes it over.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use inbox_ledger_core::{LedgerError, Store};

#[derive(Clone)]
pub struct BatchGuard {
    store: Arc<dyn Store>,
    /// Identifies this guard's leases; unique per process.
    holder: String,
    lease_ttl: Duration,
}

/// Held for the duration of one batch. Call [`release`](Self::release)
/// when the batch ends; dropping an unreleased lease releases it in the
/// background.
pub struct BatchLease {
    store: Arc<dyn Store>,
    account_id: String,
    holder: String,
    heartbeat: CancellationToken,
    released: bool,
}

impl BatchGuard {
    pub fn new(store: Arc<dyn Store>, lease_ttl: Duration) -> Self {
        Self {
            store,
            holder: uuid::Uuid::new_v4().to_string(),
            lease_ttl,
        }
    }

    /// Claim `account_id`, failing with [`LedgerError::BatchInProgress`]
    /// while any other batch, in this process or another, holds it.
    pub async fn acquire(&self, account_id: &str) -> Result<BatchLease> {
        let now = Utc::now();
        let acquired = self
            .store
            .try_acquire_batch_lease(account_id, &self.holder, now, now - self.lease_ttl)
            .await?;
        if !acquired {
            return Err(LedgerError::BatchInProgress(account_id.to_string()).into());
        }
        debug!(account = account_id, holder = %self.holder, "batch lease acquired");

        let heartbeat = CancellationToken::new();
        tokio::spawn(renew_until_cancelled(
            self.store.clone(),
            account_id.to_string(),
            self.holder.clone(),
            (self.lease_ttl / 3).to_std().unwrap_or(std::time::Duration::from_secs(1)),
            heartbeat.clone(),
        ));

        Ok(BatchLease {
            store: self.store.clone(),
            account_id: account_id.to_string(),
            holder: self.holder.clone(),
            heartbeat,
            released: false,
        })
    }
}

async fn renew_until_cancelled(
    store: Arc<dyn Store>,
    account_id: String,
    holder: String,
    every: std::time::Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(every) => {
                if let Err(e) = store.renew_batch_lease(&account_id, &holder, Utc::now()).await {
                    warn!(account = %account_id, error = %e, "failed to renew batch lease");
                }
            }
        }
    }
}

impl BatchLease {
    pub async fn release(mut self) {
        self.released = true;
        self.heartbeat.cancel();
        if let Err(e) = self
            .store
            .release_batch_lease(&self.account_id, &self.holder)
            .await
        {
            warn!(account = %self.account_id, error = %e, "failed to release batch lease");
        }
    }
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.heartbeat.cancel();
        // Reached when the batch future is dropped mid-run, e.g. an HTTP
        // client disconnecting. Without a runtime the lease simply expires.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let account_id = std::mem::take(&mut self.account_id);
            let holder = std::mem::take(&mut self.holder);
            handle.spawn(async move {
                if let Err(e) = store.release_batch_lease(&account_id, &holder).await {
                    warn!(account = %account_id, error = %e, "failed to release batch lease");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_ledger_core::InMemoryStore;

    #[tokio::test]
    async fn second_batch_for_same_account_is_rejected() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let guard = BatchGuard::new(store.clone(), Duration::minutes(10));
        let lease = guard.acquire("a").await.unwrap();
        let err = guard.acquire("a").await.err().unwrap();
        assert!(matches!(
            LedgerError::find(&err),
            Some(LedgerError::BatchInProgress(_))
        ));
        // Other accounts are unaffected.
        let other = guard.acquire("b").await.unwrap();

        lease.release().await;
        guard.acquire("a").await.unwrap().release().await;
        other.release().await;
    }

    #[tokio::test]
    async fn guards_sharing_a_store_exclude_each_other() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let cli = BatchGuard::new(store.clone(), Duration::minutes(10));
        let server = BatchGuard::new(store.clone(), Duration::minutes(10));

        let lease = cli.acquire("work").await.unwrap();
        assert!(server.acquire("work").await.is_err());
        lease.release().await;
        assert!(server.acquire("work").await.is_ok());
    }

    #[tokio::test]
    async fn heartbeat_keeps_a_long_batch_fresh() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let cli = BatchGuard::new(store.clone(), Duration::milliseconds(300));
        let server = BatchGuard::new(store.clone(), Duration::milliseconds(300));

        let lease = cli.acquire("work").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        assert!(server.acquire("work").await.is_err());

        lease.release().await;
        assert!(server.acquire("work").await.is_ok());
    }

    #[tokio::test]
    async fn abandoned_lease_goes_stale() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        store
            .try_acquire_batch_lease("work", "crashed-process", now, now)
            .await
            .unwrap();

        let guard = BatchGuard::new(store.clone(), Duration::milliseconds(100));
        assert!(guard.acquire("work").await.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(guard.acquire("work").await.is_ok());
    }
}
