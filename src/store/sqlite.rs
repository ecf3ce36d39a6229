//! Backend A: a relational table backed by the bundled embedded SQL engine.
//!
//! `rusqlite` has no async API, so each operation is dispatched through
//! [`tokio::task::spawn_blocking`] rather than held on the executor thread -
//! the crate's nearest equivalent to an "async connection" without adding a
//! second SQL dependency alongside the teacher's existing `rusqlite`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::{CredentialPatch, CredentialStore, NewCredential, TokenUpdate};
use crate::error::{Error, Result};
use crate::models::account::{AuthKind, CredentialRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kiro_accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    auth_method TEXT NOT NULL,
    provider TEXT,
    access_token TEXT NOT NULL DEFAULT '',
    refresh_token TEXT NOT NULL,
    profile_arn TEXT,
    region TEXT NOT NULL DEFAULT 'us-east-1',
    expires_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    last_used_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    request_count INTEGER NOT NULL DEFAULT 0,
    extra_data TEXT NOT NULL DEFAULT '{}'
);
";

/// Relational credential store (Backend A).
pub struct SqliteCredentialStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCredentialStore {
    /// Open (creating if absent) the database at `path` and ensure the schema exists.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Storage(e.to_string()))?;
        info!(path, "Opened SQLite credential store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Try to connect to `DATABASE_URL`-style path; returns `None` rather than
    /// erroring so callers can fall back to the file backend per the contract.
    pub fn try_open(path: &str) -> Option<Self> {
        Self::open(path).ok()
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            f(&conn)
        })
        .await
        .map_err(|e| Error::Storage(format!("blocking task panicked: {e}")))?
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<CredentialRecord> {
    let auth_method: String = row.get("auth_method")?;
    let extra_data: String = row.get("extra_data")?;
    let extra: serde_json::Value =
        serde_json::from_str(&extra_data).unwrap_or(serde_json::Value::Null);

    let parse_ts = |s: Option<String>| -> Option<DateTime<Utc>> {
        s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    Ok(CredentialRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        auth_kind: auth_method.parse().unwrap_or(AuthKind::Social),
        provider: row.get("provider")?,
        access_token: row.get("access_token")?,
        refresh_token: row.get("refresh_token")?,
        profile_arn: row.get("profile_arn")?,
        region: row.get("region")?,
        expires_at: parse_ts(row.get("expires_at")?),
        client_id: extra.get("clientId").and_then(|v| v.as_str()).map(String::from),
        client_secret: extra
            .get("clientSecret")
            .and_then(|v| v.as_str())
            .map(String::from),
        is_active: row.get::<_, i64>("is_active")? != 0,
        request_count: row.get::<_, i64>("request_count")? as u64,
        last_used_at: parse_ts(row.get("last_used_at")?),
        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>("created_at")?)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: parse_ts(row.get("updated_at")?),
    })
}

fn extra_data_json(client_id: &Option<String>, client_secret: &Option<String>) -> String {
    let mut obj = serde_json::Map::new();
    if let Some(id) = client_id {
        obj.insert("clientId".into(), serde_json::Value::String(id.clone()));
    }
    if let Some(secret) = client_secret {
        obj.insert(
            "clientSecret".into(),
            serde_json::Value::String(secret.clone()),
        );
    }
    serde_json::Value::Object(obj).to_string()
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn list_active(&self) -> Result<Vec<CredentialRecord>> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM kiro_accounts WHERE is_active = 1 ORDER BY id")
                .map_err(|e| Error::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], row_to_record)
                .map_err(|e| Error::Storage(e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::Storage(e.to_string()))
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<CredentialRecord>> {
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT * FROM kiro_accounts WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()
            .map_err(|e| Error::Storage(e.to_string()))
        })
        .await
    }

    async fn insert(&self, fields: NewCredential) -> Result<CredentialRecord> {
        self.blocking(move |conn| {
            let now = Utc::now().to_rfc3339();
            let extra = extra_data_json(&fields.client_id, &fields.client_secret);
            conn.execute(
                "INSERT INTO kiro_accounts
                 (name, auth_method, provider, access_token, refresh_token, profile_arn,
                  region, expires_at, created_at, is_active, request_count, extra_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, 0, ?10)",
                params![
                    fields.name,
                    fields.auth_kind.to_string(),
                    fields.provider,
                    fields.access_token,
                    fields.refresh_token,
                    fields.profile_arn,
                    fields.region,
                    fields.expires_at.map(|d| d.to_rfc3339()),
                    now,
                    extra,
                ],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                "SELECT * FROM kiro_accounts WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .map_err(|e| Error::Storage(e.to_string()))
        })
        .await
    }

    async fn update(&self, id: i64, patch: CredentialPatch) -> Result<CredentialRecord> {
        self.blocking(move |conn| {
            if let Some(name) = patch.name {
                conn.execute(
                    "UPDATE kiro_accounts SET name = ?1 WHERE id = ?2",
                    params![name, id],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
            if let Some(active) = patch.is_active {
                conn.execute(
                    "UPDATE kiro_accounts SET is_active = ?1 WHERE id = ?2",
                    params![active as i64, id],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
            if let Some(provider) = patch.provider {
                conn.execute(
                    "UPDATE kiro_accounts SET provider = ?1 WHERE id = ?2",
                    params![provider, id],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
            conn.execute(
                "UPDATE kiro_accounts SET updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            conn.query_row(
                "SELECT * FROM kiro_accounts WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .map_err(|e| Error::Storage(e.to_string()))
        })
        .await
    }

    async fn update_tokens(&self, id: i64, update: TokenUpdate) -> Result<CredentialRecord> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE kiro_accounts SET access_token = ?1, updated_at = ?2 WHERE id = ?3",
                params![update.access_token, Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            if let Some(refresh) = update.refresh_token.filter(|r| !r.is_empty()) {
                conn.execute(
                    "UPDATE kiro_accounts SET refresh_token = ?1 WHERE id = ?2",
                    params![refresh, id],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
            if let Some(expires_at) = update.expires_at {
                conn.execute(
                    "UPDATE kiro_accounts SET expires_at = ?1 WHERE id = ?2",
                    params![expires_at.to_rfc3339(), id],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
            if let Some(arn) = update.profile_arn {
                conn.execute(
                    "UPDATE kiro_accounts SET profile_arn = ?1 WHERE id = ?2",
                    params![arn, id],
                )
                .map_err(|e| Error::Storage(e.to_string()))?;
            }
            conn.query_row(
                "SELECT * FROM kiro_accounts WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .map_err(|e| Error::Storage(e.to_string()))
        })
        .await
    }

    async fn bump_usage(&self, id: i64) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE kiro_accounts SET request_count = request_count + 1, last_used_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.blocking(move |conn| {
            conn.execute("DELETE FROM kiro_accounts WHERE id = ?1", params![id])
                .map_err(|e| Error::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn total_request_count(&self) -> Result<u64> {
        self.blocking(|conn| {
            conn.query_row("SELECT COALESCE(SUM(request_count), 0) FROM kiro_accounts", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
            .map_err(|e| Error::Storage(e.to_string()))
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_fields(name: &str) -> NewCredential {
        NewCredential {
            name: name.into(),
            auth_kind: AuthKind::Idc,
            provider: Some("AWS".into()),
            access_token: String::new(),
            refresh_token: "rt".into(),
            profile_arn: None,
            region: "us-east-1".into(),
            expires_at: None,
            client_id: Some("C".into()),
            client_secret: Some("S".into()),
        }
    }

    #[tokio::test]
    async fn insert_and_round_trip_preserves_extra_data() {
        let store = SqliteCredentialStore::open(":memory:").unwrap();
        let rec = store.insert(new_fields("a")).await.unwrap();
        let fetched = store.get(rec.id).await.unwrap().unwrap();
        assert_eq!(fetched.client_id.as_deref(), Some("C"));
        assert_eq!(fetched.client_secret.as_deref(), Some("S"));
        assert_eq!(fetched.auth_kind, AuthKind::Idc);
    }

    #[tokio::test]
    async fn bump_usage_increments_request_count() {
        let store = SqliteCredentialStore::open(":memory:").unwrap();
        let rec = store.insert(new_fields("a")).await.unwrap();
        store.bump_usage(rec.id).await.unwrap();
        store.bump_usage(rec.id).await.unwrap();
        let fetched = store.get(rec.id).await.unwrap().unwrap();
        assert_eq!(fetched.request_count, 2);
    }
}
