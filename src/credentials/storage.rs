//! SQLite-backed connection storage.
//!
//! One row per `(user_id, service, account_label)`; upserts replace,
//! never duplicate. Tokens are encrypted before they reach SQLite and
//! decrypted on the way out.

use super::{encryption, Connection, ConnectionKey, ConnectionStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection as SqliteConnection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

/// Connection metadata safe to expose to callers: no token material.
#[derive(Clone, Debug, Serialize)]
pub struct StoredConnection {
    pub service: String,
    pub account_label: String,
    pub status: ConnectionStatus,
    pub granted_scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Encrypted connection storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE connections (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     service TEXT NOT NULL,
///     account_label TEXT NOT NULL,
///     access_token TEXT NOT NULL,   -- encrypted (nonce || ciphertext, base64)
///     refresh_token TEXT,           -- encrypted (optional)
///     granted_scopes TEXT NOT NULL, -- space-separated
///     expires_at TEXT,              -- RFC 3339 (optional)
///     status TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, service, account_label)
/// );
/// ```
///
/// # Thread safety
/// The SQLite connection is behind a Mutex; SQLite's ACID guarantees
/// prevent partially written rows. Serialization of refresh writes is
/// the refresh coordinator's job, not the store's.
pub struct CredentialStore {
    conn: Mutex<SqliteConnection>,
    encryption_key: Vec<u8>,
}

impl CredentialStore {
    /// Creates or opens a store at `db_path` with a base64 master key.
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let key_bytes =
            encryption::validate_key(encryption_key).context("Invalid encryption key")?;

        let conn = SqliteConnection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                service TEXT NOT NULL,
                account_label TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                granted_scopes TEXT NOT NULL,
                expires_at TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, service, account_label)
            )
            "#,
            [],
        )
        .context("Failed to create connections table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_connection_key \
             ON connections(user_id, service, account_label)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            encryption_key: key_bytes,
        })
    }

    /// Inserts or replaces a connection row.
    ///
    /// On conflict the existing `created_at` is preserved and all other
    /// columns are replaced, so a fresh authorization flow over a
    /// revoked row restores it to the new grant.
    pub fn upsert(&self, connection: &Connection) -> Result<()> {
        let access_token = encryption::encrypt(&connection.access_token, &self.encryption_key)
            .context("Failed to encrypt access token")?;

        let refresh_token = connection
            .refresh_token
            .as_deref()
            .map(|token| encryption::encrypt(token, &self.encryption_key))
            .transpose()
            .context("Failed to encrypt refresh token")?;

        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO connections (
                    user_id, service, account_label,
                    access_token, refresh_token,
                    granted_scopes, expires_at, status,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(user_id, service, account_label) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    granted_scopes = excluded.granted_scopes,
                    expires_at = excluded.expires_at,
                    status = excluded.status,
                    updated_at = excluded.updated_at
                "#,
                params![
                    connection.key.user_id,
                    connection.key.service,
                    connection.key.account_label,
                    access_token,
                    refresh_token,
                    connection.granted_scopes.join(" "),
                    connection.expires_at.map(|dt| dt.to_rfc3339()),
                    connection.status.as_str(),
                    now,
                    now,
                ],
            )
            .context("Failed to upsert connection")?;

        Ok(())
    }

    /// Retrieves and decrypts a connection.
    pub fn get(&self, key: &ConnectionKey) -> Result<Option<Connection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT access_token, refresh_token, granted_scopes, expires_at, status
                FROM connections
                WHERE user_id = ?1 AND service = ?2 AND account_label = ?3
                "#,
            )
            .context("Failed to prepare query")?;

        let row = stmt
            .query_row(
                params![key.user_id, key.service, key.account_label],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query connection")?;

        let Some((access_blob, refresh_blob, scopes, expires_at, status)) = row else {
            return Ok(None);
        };

        let access_token = encryption::decrypt(&access_blob, &self.encryption_key)
            .context("Failed to decrypt access token")?;
        let refresh_token = refresh_blob
            .map(|blob| encryption::decrypt(&blob, &self.encryption_key))
            .transpose()
            .context("Failed to decrypt refresh token")?;

        let status = ConnectionStatus::parse(&status)
            .ok_or_else(|| anyhow!("Unknown connection status '{}'", status))?;

        Ok(Some(Connection {
            key: key.clone(),
            access_token,
            refresh_token,
            granted_scopes: split_scopes(&scopes),
            expires_at: parse_timestamp(expires_at)?,
            status,
        }))
    }

    /// Sets the status of an existing connection.
    ///
    /// Returns false if no row matched.
    pub fn set_status(&self, key: &ConnectionKey, status: ConnectionStatus) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE connections SET status = ?1, updated_at = ?2
                WHERE user_id = ?3 AND service = ?4 AND account_label = ?5
                "#,
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    key.user_id,
                    key.service,
                    key.account_label,
                ],
            )
            .context("Failed to update connection status")?;

        Ok(rows > 0)
    }

    /// Applies a successful refresh: replaces the access token, rotates
    /// the refresh token when the provider issued a new one, updates
    /// `expires_at`, and marks the connection active. A single UPDATE,
    /// so callers never observe a half-applied rotation.
    pub fn apply_refresh(
        &self,
        key: &ConnectionKey,
        access_token: &str,
        rotated_refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let access_blob = encryption::encrypt(access_token, &self.encryption_key)
            .context("Failed to encrypt access token")?;
        let refresh_blob = rotated_refresh_token
            .map(|token| encryption::encrypt(token, &self.encryption_key))
            .transpose()
            .context("Failed to encrypt rotated refresh token")?;

        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE connections SET
                    access_token = ?1,
                    refresh_token = COALESCE(?2, refresh_token),
                    expires_at = ?3,
                    status = ?4,
                    updated_at = ?5
                WHERE user_id = ?6 AND service = ?7 AND account_label = ?8
                "#,
                params![
                    access_blob,
                    refresh_blob,
                    expires_at.map(|dt| dt.to_rfc3339()),
                    ConnectionStatus::Active.as_str(),
                    Utc::now().to_rfc3339(),
                    key.user_id,
                    key.service,
                    key.account_label,
                ],
            )
            .context("Failed to apply refresh")?;

        if rows == 0 {
            return Err(anyhow!("Connection {} vanished during refresh", key));
        }

        Ok(())
    }

    /// Deletes a connection row.
    ///
    /// Returns false if no row matched.
    pub fn delete(&self, key: &ConnectionKey) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM connections \
                 WHERE user_id = ?1 AND service = ?2 AND account_label = ?3",
                params![key.user_id, key.service, key.account_label],
            )
            .context("Failed to delete connection")?;

        Ok(rows > 0)
    }

    /// Lists connection metadata for a user (no token material).
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<StoredConnection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT service, account_label, status, granted_scopes,
                       expires_at, created_at, updated_at
                FROM connections
                WHERE user_id = ?1
                ORDER BY service, account_label
                "#,
            )
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter()
            .map(
                |(service, account_label, status, scopes, expires_at, created_at, updated_at)| {
                    Ok(StoredConnection {
                        service,
                        account_label,
                        status: ConnectionStatus::parse(&status)
                            .ok_or_else(|| anyhow!("Unknown connection status '{}'", status))?,
                        granted_scopes: split_scopes(&scopes),
                        expires_at: parse_timestamp(expires_at)?,
                        created_at: parse_timestamp(Some(created_at))?
                            .ok_or_else(|| anyhow!("Missing created_at"))?,
                        updated_at: parse_timestamp(Some(updated_at))?
                            .ok_or_else(|| anyhow!("Missing updated_at"))?,
                    })
                },
            )
            .collect()
    }
}

fn split_scopes(joined: &str) -> Vec<String> {
    joined.split_whitespace().map(str::to_string).collect()
}

fn parse_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .context("Failed to parse stored timestamp")
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn create_test_store() -> CredentialStore {
        let key = BASE64.encode([0u8; 32]);
        CredentialStore::new(":memory:", &key).expect("Failed to create test store")
    }

    fn test_connection(key: ConnectionKey) -> Connection {
        Connection {
            key,
            access_token: "access-token-12345".to_string(),
            refresh_token: Some("refresh-token-67890".to_string()),
            granted_scopes: vec!["repo".to_string(), "read:user".to_string()],
            expires_at: Some(Utc::now() + Duration::hours(1)),
            status: ConnectionStatus::Active,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let store = create_test_store();
        let key = ConnectionKey::new("user1", "github", None);
        let conn = test_connection(key.clone());

        store.upsert(&conn).expect("Failed to upsert");

        let retrieved = store
            .get(&key)
            .expect("Failed to get")
            .expect("Connection not found");

        assert_eq!(retrieved.access_token, conn.access_token);
        assert_eq!(retrieved.refresh_token, conn.refresh_token);
        assert_eq!(retrieved.granted_scopes, conn.granted_scopes);
        assert_eq!(retrieved.status, ConnectionStatus::Active);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        let key = ConnectionKey::new("user1", "github", None);
        assert!(store.get(&key).expect("Failed to get").is_none());
    }

    #[test]
    fn test_upsert_replaces_never_duplicates() {
        let store = create_test_store();
        let key = ConnectionKey::new("user1", "github", None);

        store.upsert(&test_connection(key.clone())).unwrap();

        let mut replacement = test_connection(key.clone());
        replacement.access_token = "second-token".to_string();
        replacement.granted_scopes = vec!["repo".to_string(), "workflow".to_string()];
        store.upsert(&replacement).unwrap();

        let listed = store.list_by_user("user1").unwrap();
        assert_eq!(listed.len(), 1);

        let retrieved = store.get(&key).unwrap().unwrap();
        assert_eq!(retrieved.access_token, "second-token");
        assert!(retrieved.granted_scopes.contains(&"workflow".to_string()));
    }

    #[test]
    fn test_multiple_accounts_per_service() {
        let store = create_test_store();
        let personal = ConnectionKey::new("user1", "gmail", Some("personal"));
        let work = ConnectionKey::new("user1", "gmail", Some("work"));

        store.upsert(&test_connection(personal.clone())).unwrap();
        store.upsert(&test_connection(work.clone())).unwrap();

        let listed = store.list_by_user("user1").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(store.get(&personal).unwrap().is_some());
        assert!(store.get(&work).unwrap().is_some());
    }

    #[test]
    fn test_set_status() {
        let store = create_test_store();
        let key = ConnectionKey::new("user1", "github", None);

        store.upsert(&test_connection(key.clone())).unwrap();
        assert!(store.set_status(&key, ConnectionStatus::Revoked).unwrap());

        let retrieved = store.get(&key).unwrap().unwrap();
        assert_eq!(retrieved.status, ConnectionStatus::Revoked);

        let missing = ConnectionKey::new("user2", "github", None);
        assert!(!store.set_status(&missing, ConnectionStatus::Revoked).unwrap());
    }

    #[test]
    fn test_apply_refresh_rotates_tokens() {
        let store = create_test_store();
        let key = ConnectionKey::new("user1", "github", None);
        let mut conn = test_connection(key.clone());
        conn.status = ConnectionStatus::Refreshing;
        store.upsert(&conn).unwrap();

        let new_expiry = Utc::now() + Duration::hours(6);
        store
            .apply_refresh(&key, "new-access", Some("new-refresh"), Some(new_expiry))
            .unwrap();

        let retrieved = store.get(&key).unwrap().unwrap();
        assert_eq!(retrieved.access_token, "new-access");
        assert_eq!(retrieved.refresh_token, Some("new-refresh".to_string()));
        assert_eq!(retrieved.status, ConnectionStatus::Active);
        assert!(retrieved.expires_at.unwrap() > conn.expires_at.unwrap());
    }

    #[test]
    fn test_apply_refresh_keeps_unrotated_refresh_token() {
        let store = create_test_store();
        let key = ConnectionKey::new("user1", "github", None);
        store.upsert(&test_connection(key.clone())).unwrap();

        store
            .apply_refresh(&key, "new-access", None, Some(Utc::now() + Duration::hours(2)))
            .unwrap();

        let retrieved = store.get(&key).unwrap().unwrap();
        assert_eq!(retrieved.access_token, "new-access");
        // Provider did not rotate; old refresh token survives
        assert_eq!(retrieved.refresh_token, Some("refresh-token-67890".to_string()));
    }

    #[test]
    fn test_delete() {
        let store = create_test_store();
        let key = ConnectionKey::new("user1", "github", None);
        store.upsert(&test_connection(key.clone())).unwrap();

        assert!(store.delete(&key).unwrap());
        assert!(store.get(&key).unwrap().is_none());
        assert!(!store.delete(&key).unwrap());
    }

    #[test]
    fn test_tokens_not_stored_in_plaintext() {
        let key_b64 = BASE64.encode([0u8; 32]);
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("connections.db");

        {
            let store = CredentialStore::new(&db_path, &key_b64).unwrap();
            let key = ConnectionKey::new("user1", "github", None);
            store.upsert(&test_connection(key)).unwrap();
        }

        let raw = std::fs::read(&db_path).unwrap();
        let raw_text = String::from_utf8_lossy(&raw);
        assert!(!raw_text.contains("access-token-12345"));
        assert!(!raw_text.contains("refresh-token-67890"));
    }

    #[test]
    fn test_connection_without_refresh_token() {
        let store = create_test_store();
        let key = ConnectionKey::new("user1", "github", None);
        let conn = Connection {
            key: key.clone(),
            access_token: "access-only".to_string(),
            refresh_token: None,
            granted_scopes: vec!["repo".to_string()],
            expires_at: None,
            status: ConnectionStatus::Active,
        };
        store.upsert(&conn).unwrap();

        let retrieved = store.get(&key).unwrap().unwrap();
        assert_eq!(retrieved.access_token, "access-only");
        assert!(retrieved.refresh_token.is_none());
        assert!(retrieved.expires_at.is_none());
    }

    #[test]
    fn test_invalid_encryption_key() {
        assert!(CredentialStore::new(":memory:", "short").is_err());
        assert!(CredentialStore::new(":memory:", "not-valid-base64!@#$").is_err());
    }
}
