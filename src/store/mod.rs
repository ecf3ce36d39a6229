//! Credential record persistence: two interchangeable backends behind one contract.
//!
//! - [`FileCredentialStore`] — single JSON document, full-document rewrite under an
//!   in-process lock. Always available; the fallback when no connection string is set.
//! - [`SqliteCredentialStore`] — relational table backed by the bundled embedded SQL
//!   engine (feature `sqlite`). Selected when `DATABASE_URL` is present, with automatic
//!   fallback to the file backend on connection failure.

mod file;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use file::FileCredentialStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCredentialStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::account::{AuthKind, CredentialRecord};

/// Fields needed to create a new credential record. `id`, `created_at` and the
/// accounting fields are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewCredential {
    /// Human label.
    pub name: String,
    /// Nominal auth protocol family.
    pub auth_kind: AuthKind,
    /// Optional identity-provider tag.
    pub provider: Option<String>,
    /// Initial access token (may be empty if not yet obtained).
    pub access_token: String,
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// CodeWhisperer profile ARN, if known.
    pub profile_arn: Option<String>,
    /// Upstream region tag.
    pub region: String,
    /// Initial expiry, if known.
    pub expires_at: Option<DateTime<Utc>>,
    /// OAuth client id (device-code credentials).
    pub client_id: Option<String>,
    /// OAuth client secret (device-code credentials).
    pub client_secret: Option<String>,
}

/// Partial update to administrative fields. `None` means "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct CredentialPatch {
    /// New human label.
    pub name: Option<String>,
    /// New activation state.
    pub is_active: Option<bool>,
    /// New provider tag.
    pub provider: Option<Option<String>>,
}

/// Specialised atomic update used by the refresh path (C3).
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    /// New access token.
    pub access_token: String,
    /// New refresh token, if the upstream rotated it.
    pub refresh_token: Option<String>,
    /// New expiry, if the upstream reported one.
    pub expires_at: Option<DateTime<Utc>>,
    /// New profile ARN, if the upstream reported one (social refresh only).
    pub profile_arn: Option<String>,
}

/// Contract shared by both credential-store backends.
///
/// Implementations never leak backend-specific error types; all failures are
/// represented as [`crate::error::Error`].
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// All records with `is_active = true`.
    async fn list_active(&self) -> Result<Vec<CredentialRecord>>;

    /// A single record by id, or `None` if it does not exist.
    async fn get(&self, id: i64) -> Result<Option<CredentialRecord>>;

    /// Insert a new record, assigning the next id and `created_at = now`.
    async fn insert(&self, fields: NewCredential) -> Result<CredentialRecord>;

    /// Apply a partial administrative update; touches `updated_at`.
    async fn update(&self, id: i64, patch: CredentialPatch) -> Result<CredentialRecord>;

    /// Atomically update the token-bearing fields after a successful refresh.
    async fn update_tokens(&self, id: i64, update: TokenUpdate) -> Result<CredentialRecord>;

    /// Record a use: bump `request_count` and set `last_used_at = now`.
    async fn bump_usage(&self, id: i64) -> Result<()>;

    /// Permanently remove a record.
    async fn delete(&self, id: i64) -> Result<()>;

    /// Sum of `request_count` across all records.
    async fn total_request_count(&self) -> Result<u64>;

    /// Name of this backend, for logging.
    fn name(&self) -> &str {
        "unknown"
    }
}

#[async_trait]
impl<T: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<T> {
    async fn list_active(&self) -> Result<Vec<CredentialRecord>> {
        (**self).list_active().await
    }
    async fn get(&self, id: i64) -> Result<Option<CredentialRecord>> {
        (**self).get(id).await
    }
    async fn insert(&self, fields: NewCredential) -> Result<CredentialRecord> {
        (**self).insert(fields).await
    }
    async fn update(&self, id: i64, patch: CredentialPatch) -> Result<CredentialRecord> {
        (**self).update(id, patch).await
    }
    async fn update_tokens(&self, id: i64, update: TokenUpdate) -> Result<CredentialRecord> {
        (**self).update_tokens(id, update).await
    }
    async fn bump_usage(&self, id: i64) -> Result<()> {
        (**self).bump_usage(id).await
    }
    async fn delete(&self, id: i64) -> Result<()> {
        (**self).delete(id).await
    }
    async fn total_request_count(&self) -> Result<u64> {
        (**self).total_request_count().await
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}
