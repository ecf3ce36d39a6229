//! Account Pool (C5): round-robin selection across active credential
//! records, with a background expiration-aware refresh loop.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{FALLBACK_REFRESH_INTERVAL, MAX_CHECK_INTERVAL, MIN_REFRESH_INTERVAL};
use crate::error::Result;
use crate::models::account::CredentialRecord;
use crate::refresher::TokenRefresher;
use crate::store::CredentialStore;

struct PoolState {
    /// Ordered ids, defining round-robin order. Source of truth for cursor motion.
    order: Vec<i64>,
    /// Cursor into `order`: index of the next id to hand out.
    cursor: usize,
    /// id -> current record, kept in sync with the store on load/refresh.
    records: std::collections::HashMap<i64, CredentialRecord>,
}

impl PoolState {
    fn empty() -> Self {
        Self {
            order: Vec::new(),
            cursor: 0,
            records: std::collections::HashMap::new(),
        }
    }

    fn rebuild(&mut self, records: Vec<CredentialRecord>) {
        let previous_current = self.order.get(self.cursor).copied();
        self.order = records.iter().map(|r| r.id).collect();
        self.records = records.into_iter().map(|r| (r.id, r)).collect();
        // Keep pointing at the same account if it survived the reload; otherwise
        // reset to the front, per the cursor-reset-on-removal rule.
        self.cursor = previous_current
            .and_then(|id| self.order.iter().position(|&x| x == id))
            .unwrap_or(0);
    }

    fn remove(&mut self, id: i64) {
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            } else if self.cursor >= self.order.len() {
                self.cursor = 0;
            }
        }
        self.records.remove(&id);
    }
}

/// Maintains the set of active accounts and hands them out round-robin.
///
/// Selection is fire-and-forget: `next()` returns a record and spawns a
/// detached task to bump its usage counter, rather than awaiting the store
/// write on the request's hot path.
pub struct AccountPool {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<TokenRefresher>,
    state: Mutex<PoolState>,
}

impl AccountPool {
    /// Build an empty pool; call [`AccountPool::load`] before first use.
    pub fn new(store: Arc<dyn CredentialStore>) -> Arc<Self> {
        let refresher = Arc::new(TokenRefresher::new(store.clone()));
        Arc::new(Self {
            store,
            refresher,
            state: Mutex::new(PoolState::empty()),
        })
    }

    /// (Re)load all active records from the backing store.
    pub async fn load(&self) -> Result<usize> {
        let records = self.store.list_active().await?;
        let count = records.len();
        let mut state = self.state.lock().await;
        state.rebuild(records);
        info!(accounts = count, "Account pool loaded");
        Ok(count)
    }

    /// Number of accounts currently in the pool.
    pub async fn len(&self) -> usize {
        self.state.lock().await.order.len()
    }

    /// True if the pool currently holds no accounts.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Hand out the next account in round-robin order, advancing the cursor.
    ///
    /// Returns `None` if the pool is empty. Usage accounting (`bump_usage`) is
    /// fired off in the background and does not block the caller.
    pub async fn next(&self) -> Option<CredentialRecord> {
        let record = {
            let mut state = self.state.lock().await;
            if state.order.is_empty() {
                return None;
            }
            let id = state.order[state.cursor % state.order.len()];
            state.cursor = (state.cursor + 1) % state.order.len();
            state.records.get(&id).cloned()
        };

        if let Some(record) = &record {
            let store = self.store.clone();
            let id = record.id;
            tokio::spawn(async move {
                if let Err(e) = store.bump_usage(id).await {
                    warn!(id, error = %e, "Failed to record account usage");
                }
            });
        }
        record
    }

    /// Refresh a single account's tokens and update the in-memory copy.
    pub async fn refresh_one(&self, id: i64) -> Result<CredentialRecord> {
        let record = {
            let state = self.state.lock().await;
            state.records.get(&id).cloned()
        };
        let record = match record {
            Some(r) => r,
            None => match self.store.get(id).await? {
                Some(r) => r,
                None => {
                    return Err(crate::error::Error::MissingCredential(format!(
                        "account {id} not found"
                    )))
                }
            },
        };
        let refreshed = self.refresher.refresh(&record).await?;
        let mut state = self.state.lock().await;
        if let Some(slot) = state.records.get_mut(&id) {
            *slot = refreshed.clone();
        }
        Ok(refreshed)
    }

    /// Refresh every account currently in the pool.
    ///
    /// When `force` is false, accounts that are not expiring soon are skipped.
    /// Failures for individual accounts are logged and do not abort the sweep.
    pub async fn refresh_all(&self, force: bool) {
        let candidates: Vec<CredentialRecord> = {
            let state = self.state.lock().await;
            state.records.values().cloned().collect()
        };
        for record in candidates {
            if !force && !record.is_expiring_soon() {
                continue;
            }
            if let Err(e) = self.refresh_one(record.id).await {
                warn!(id = record.id, error = %e, "Background refresh failed");
            }
        }
    }

    /// Remove an account from the pool (its store row is left untouched; callers
    /// that also want deletion should call [`CredentialStore::delete`] separately).
    pub async fn evict(&self, id: i64) {
        let mut state = self.state.lock().await;
        state.remove(id);
    }

    /// Delay before the next background refresh tick.
    ///
    /// Computed from the soonest expiry among known records, clamped to
    /// `[MIN_REFRESH_INTERVAL, MAX_CHECK_INTERVAL]`. Falls back to
    /// `FALLBACK_REFRESH_INTERVAL` when no record carries an expiry.
    async fn next_tick_delay(&self) -> Duration {
        let state = self.state.lock().await;
        let now = chrono::Utc::now();
        let soonest_ttl = state
            .records
            .values()
            .filter_map(|r| r.expires_at)
            .map(|exp| (exp - now).num_seconds())
            .min();

        match soonest_ttl {
            Some(ttl) => {
                let secs = ttl.max(MIN_REFRESH_INTERVAL.as_secs() as i64) as u64;
                Duration::from_secs(secs.min(MAX_CHECK_INTERVAL.as_secs()))
            }
            None => FALLBACK_REFRESH_INTERVAL,
        }
    }

    /// Run the background refresh loop until the process exits. Intended to be
    /// spawned once as a detached task alongside the pool.
    pub async fn run_refresh_loop(self: Arc<Self>) {
        loop {
            let delay = self.next_tick_delay().await;
            debug!(?delay, "Account pool sleeping until next refresh check");
            tokio::time::sleep(delay).await;
            self.refresh_all(false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::AuthKind;
    use crate::store::{FileCredentialStore, NewCredential};

    async fn pool_with(n: usize) -> Arc<AccountPool> {
        let dir = std::env::temp_dir().join(format!("kiro-gw-pool-{}", uuid::Uuid::new_v4()));
        let store: Arc<dyn CredentialStore> =
            Arc::new(FileCredentialStore::open(dir.join("accounts.json")).unwrap());
        for i in 0..n {
            store
                .insert(NewCredential {
                    name: format!("acct-{i}"),
                    auth_kind: AuthKind::Social,
                    provider: None,
                    access_token: "tok".into(),
                    refresh_token: "rt".into(),
                    profile_arn: None,
                    region: "us-east-1".into(),
                    expires_at: None,
                    client_id: None,
                    client_secret: None,
                })
                .await
                .unwrap();
        }
        let pool = AccountPool::new(store);
        pool.load().await.unwrap();
        pool
    }

    #[tokio::test]
    async fn round_robins_across_three_accounts() {
        let pool = pool_with(3).await;
        let a = pool.next().await.unwrap();
        let b = pool.next().await.unwrap();
        let c = pool.next().await.unwrap();
        let d = pool.next().await.unwrap();
        assert_eq!(d.id, a.id);
        assert_ne!(a.id, b.id);
        assert_ne!(b.id, c.id);
    }

    #[tokio::test]
    async fn empty_pool_returns_none() {
        let pool = pool_with(0).await;
        assert!(pool.next().await.is_none());
    }

    #[tokio::test]
    async fn eviction_resets_cursor_when_current_removed() {
        let pool = pool_with(3).await;
        let first = pool.next().await.unwrap();
        pool.evict(first.id).await;
        assert_eq!(pool.len().await, 2);
        // Cursor should still yield valid, distinct accounts after eviction.
        let x = pool.next().await.unwrap();
        let y = pool.next().await.unwrap();
        assert_ne!(x.id, first.id);
        assert_ne!(y.id, first.id);
    }
}
