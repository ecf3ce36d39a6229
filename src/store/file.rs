//! Backend B: a single JSON document, full-document rewrite under an in-process lock.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{CredentialPatch, CredentialStore, NewCredential, TokenUpdate};
use crate::error::{Error, Result};
use crate::models::account::CredentialRecord;

#[derive(Debug, Serialize, Deserialize, Default)]
struct Document {
    next_id: i64,
    accounts: Vec<CredentialRecord>,
}

/// Single-document JSON credential store (Backend B).
///
/// In-memory state is authoritative once loaded; it is read from disk only at
/// construction. Write failures are logged and swallowed rather than
/// propagated, matching the durability tradeoff of the reference design.
pub struct FileCredentialStore {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl FileCredentialStore {
    /// Load (or initialize) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = Self::read_document(&path)?;
        info!(accounts = doc.accounts.len(), path = %path.display(), "Loaded credential store");
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Default path: `~/.config/kiro-gateway/accounts.json`.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot determine config directory".into()))?;
        Ok(config_dir.join("kiro-gateway").join("accounts.json"))
    }

    fn read_document(path: &Path) -> Result<Document> {
        if !path.exists() {
            return Ok(Document {
                next_id: 1,
                accounts: Vec::new(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| Error::storage_io(path, e.to_string()))?;
        if content.trim().is_empty() {
            return Ok(Document {
                next_id: 1,
                accounts: Vec::new(),
            });
        }
        serde_json::from_str(&content).map_err(|e| Error::StorageSerialization(e.to_string()))
    }

    /// Best-effort full-document rewrite. Failures are logged, never propagated:
    /// the in-memory copy stays authoritative until the next process start.
    fn persist(&self, doc: &Document) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!(error = %e, "Failed to create credential store directory");
                return;
            }
        }
        let content = match serde_json::to_string_pretty(doc) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Failed to serialize credential store");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, &content) {
            error!(error = %e, path = %self.path.display(), "Failed to persist credential store");
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&self.path, perms);
        }
        debug!(accounts = doc.accounts.len(), "Credential store persisted");
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn list_active(&self) -> Result<Vec<CredentialRecord>> {
        let doc = self.doc.lock().unwrap();
        Ok(doc
            .accounts
            .iter()
            .filter(|r| r.is_active)
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<CredentialRecord>> {
        let doc = self.doc.lock().unwrap();
        Ok(doc.accounts.iter().find(|r| r.id == id).cloned())
    }

    async fn insert(&self, fields: NewCredential) -> Result<CredentialRecord> {
        let mut doc = self.doc.lock().unwrap();
        let id = doc.next_id;
        doc.next_id += 1;
        let record = CredentialRecord {
            id,
            name: fields.name,
            auth_kind: fields.auth_kind,
            provider: fields.provider,
            access_token: fields.access_token,
            refresh_token: fields.refresh_token,
            profile_arn: fields.profile_arn,
            region: fields.region,
            expires_at: fields.expires_at,
            client_id: fields.client_id,
            client_secret: fields.client_secret,
            is_active: true,
            request_count: 0,
            last_used_at: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        doc.accounts.push(record.clone());
        self.persist(&doc);
        Ok(record)
    }

    async fn update(&self, id: i64, patch: CredentialPatch) -> Result<CredentialRecord> {
        let mut doc = self.doc.lock().unwrap();
        let record = doc
            .accounts
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::Storage(format!("no such credential record: {id}")))?;
        if let Some(name) = patch.name {
            record.name = name;
        }
        if let Some(active) = patch.is_active {
            record.is_active = active;
        }
        if let Some(provider) = patch.provider {
            record.provider = provider;
        }
        record.updated_at = Some(Utc::now());
        let updated = record.clone();
        self.persist(&doc);
        Ok(updated)
    }

    async fn update_tokens(&self, id: i64, update: TokenUpdate) -> Result<CredentialRecord> {
        let mut doc = self.doc.lock().unwrap();
        let record = doc
            .accounts
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::Storage(format!("no such credential record: {id}")))?;
        record.access_token = update.access_token;
        if let Some(refresh) = update.refresh_token {
            if !refresh.is_empty() {
                record.refresh_token = refresh;
            }
        }
        if let Some(expires_at) = update.expires_at {
            record.expires_at = Some(expires_at);
        }
        if let Some(arn) = update.profile_arn {
            record.profile_arn = Some(arn);
        }
        record.updated_at = Some(Utc::now());
        let updated = record.clone();
        self.persist(&doc);
        Ok(updated)
    }

    async fn bump_usage(&self, id: i64) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        if let Some(record) = doc.accounts.iter_mut().find(|r| r.id == id) {
            record.request_count += 1;
            record.last_used_at = Some(Utc::now());
        }
        self.persist(&doc);
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.accounts.retain(|r| r.id != id);
        self.persist(&doc);
        Ok(())
    }

    async fn total_request_count(&self) -> Result<u64> {
        let doc = self.doc.lock().unwrap();
        Ok(doc.accounts.iter().map(|r| r.request_count).sum())
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::AuthKind;

    fn new_fields(name: &str) -> NewCredential {
        NewCredential {
            name: name.into(),
            auth_kind: AuthKind::Social,
            provider: None,
            access_token: String::new(),
            refresh_token: "rt".into(),
            profile_arn: None,
            region: "us-east-1".into(),
            expires_at: None,
            client_id: None,
            client_secret: None,
        }
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids_and_round_trips() {
        let dir = std::env::temp_dir().join(format!("kiro-gw-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("accounts.json");
        let store = FileCredentialStore::open(&path).unwrap();

        let a = store.insert(new_fields("a")).await.unwrap();
        let b = store.insert(new_fields("b")).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        let reopened = FileCredentialStore::open(&path).unwrap();
        let active = reopened.list_active().await.unwrap();
        assert_eq!(active.len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn update_tokens_keeps_previous_refresh_token_when_absent() {
        let dir = std::env::temp_dir().join(format!("kiro-gw-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("accounts.json");
        let store = FileCredentialStore::open(&path).unwrap();
        let rec = store.insert(new_fields("a")).await.unwrap();

        let updated = store
            .update_tokens(
                rec.id,
                TokenUpdate {
                    access_token: "new-access".into(),
                    refresh_token: None,
                    expires_at: None,
                    profile_arn: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.access_token, "new-access");
        assert_eq!(updated.refresh_token, "rt");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
