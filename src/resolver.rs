//! Request Auth Resolver (C6): per-request choice of credential among a
//! pool account, a single static credential, or a caller-supplied bearer
//! token.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::BEARER_CACHE_TTL;
use crate::error::{Error, Result};
use crate::models::account::CredentialRecord;
use crate::pool::AccountPool;
use crate::refresher::TokenRefresher;
use crate::store::{CredentialStore, NewCredential};

/// Dispatch mode selected by the `AUTH_MODE` configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Prefer the account pool; fall back to the single credential if empty.
    Pool,
    /// Always use the single process-wide credential.
    Single,
    /// Resolve a credential from the inbound `Authorization` header per request.
    PerRequest,
}

impl std::str::FromStr for AuthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pool" => Ok(Self::Pool),
            "single" => Ok(Self::Single),
            "per_request" => Ok(Self::PerRequest),
            other => Err(Error::Config(format!("invalid AUTH_MODE: {other}"))),
        }
    }
}

struct CacheEntry {
    record: CredentialRecord,
    last_used_at: Instant,
}

/// Resolves the credential to use for a single inbound request.
pub struct AuthResolver {
    mode: AuthMode,
    pool: Option<Arc<AccountPool>>,
    single: Option<Arc<tokio::sync::RwLock<CredentialRecord>>>,
    store: Arc<dyn CredentialStore>,
    refresher: Arc<TokenRefresher>,
    bearer_cache: Mutex<HashMap<String, CacheEntry>>,
}

impl AuthResolver {
    /// Build a resolver. `single` is the process-wide fallback credential used
    /// by [`AuthMode::Single`] and by [`AuthMode::Pool`] when the pool is empty.
    pub fn new(
        mode: AuthMode,
        store: Arc<dyn CredentialStore>,
        pool: Option<Arc<AccountPool>>,
        single: Option<CredentialRecord>,
    ) -> Self {
        let refresher = Arc::new(TokenRefresher::new(store.clone()));
        Self {
            mode,
            pool,
            single: single.map(|r| Arc::new(tokio::sync::RwLock::new(r))),
            store,
            refresher,
            bearer_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a credential for one inbound request.
    ///
    /// `bearer` is the raw token from the inbound `Authorization` header,
    /// required only in [`AuthMode::PerRequest`].
    pub async fn resolve(&self, bearer: Option<&str>) -> Result<CredentialRecord> {
        match self.mode {
            AuthMode::Pool => {
                if let Some(pool) = &self.pool {
                    if let Some(record) = pool.next().await {
                        return Ok(record);
                    }
                }
                self.resolve_single().await
            }
            AuthMode::Single => self.resolve_single().await,
            AuthMode::PerRequest => {
                let token = bearer
                    .ok_or_else(|| Error::AuthenticationError("missing bearer token".into()))?;
                self.resolve_bearer(token).await
            }
        }
    }

    async fn resolve_single(&self) -> Result<CredentialRecord> {
        let cell = self
            .single
            .as_ref()
            .ok_or_else(|| Error::AuthenticationError("no single credential configured".into()))?;

        let needs_refresh = {
            let guard = cell.read().await;
            guard.is_expiring_soon() || guard.access_token.is_empty()
        };
        if needs_refresh {
            let record = cell.read().await.clone();
            let refreshed = self
                .refresher
                .refresh(&record)
                .await
                .map_err(|e| Error::AuthenticationError(e.to_string()))?;
            *cell.write().await = refreshed;
        }
        Ok(cell.read().await.clone())
    }

    async fn resolve_bearer(&self, token: &str) -> Result<CredentialRecord> {
        let key = hash_token(token);

        {
            let mut cache = self.bearer_cache.lock().await;
            if let Some(entry) = cache.get_mut(&key) {
                entry.last_used_at = Instant::now();
                if entry.record.is_expiring_soon() {
                    let refreshed = self
                        .refresher
                        .refresh(&entry.record)
                        .await
                        .map_err(|e| Error::AuthenticationError(e.to_string()))?;
                    entry.record = refreshed.clone();
                    return Ok(refreshed);
                }
                return Ok(entry.record.clone());
            }
        }

        debug!("Bearer cache miss, resolving new per-request credential");
        let record = self.new_bearer_credential(token).await?;
        let validated = self
            .refresher
            .refresh(&record)
            .await
            .map_err(|e| Error::AuthenticationError(e.to_string()))?;

        let mut cache = self.bearer_cache.lock().await;
        cache.insert(
            key,
            CacheEntry {
                record: validated.clone(),
                last_used_at: Instant::now(),
            },
        );
        Ok(validated)
    }

    /// Build a fresh transient credential record from a caller-supplied bearer
    /// token, treating it as a refresh token for the Kiro-Desktop (social) flow.
    async fn new_bearer_credential(&self, token: &str) -> Result<CredentialRecord> {
        self.store
            .insert(NewCredential {
                name: "per-request".into(),
                auth_kind: crate::models::account::AuthKind::Social,
                provider: None,
                access_token: String::new(),
                refresh_token: token.to_string(),
                profile_arn: None,
                region: crate::config::DEFAULT_REGION.into(),
                expires_at: None,
                client_id: None,
                client_secret: None,
            })
            .await
    }

    /// Remove bearer-cache entries idle for longer than [`BEARER_CACHE_TTL`].
    /// Intended to be called periodically from a background sweep task.
    pub async fn sweep_bearer_cache(&self) {
        let mut cache = self.bearer_cache.lock().await;
        let now = Instant::now();
        let before = cache.len();
        cache.retain(|_, entry| now.duration_since(entry.last_used_at) <= BEARER_CACHE_TTL);
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "Swept idle bearer-cache entries");
        }
    }
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_token_is_16_hex_chars_and_stable() {
        let a = hash_token("secret-refresh-token");
        let b = hash_token("secret-refresh-token");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, hash_token("different-token"));
    }

    #[test]
    fn auth_mode_parses_recognised_values_only() {
        assert_eq!("pool".parse::<AuthMode>().unwrap(), AuthMode::Pool);
        assert_eq!("single".parse::<AuthMode>().unwrap(), AuthMode::Single);
        assert_eq!("per_request".parse::<AuthMode>().unwrap(), AuthMode::PerRequest);
        assert!("bogus".parse::<AuthMode>().is_err());
    }
}
