//! Encrypted persistence for OAuth connections.
//!
//! A [`Connection`] is the unit of authorization between one local user
//! and one account on one external service, identified by
//! `(user_id, service, account_label)`. Tokens are encrypted at rest
//! with AES-256-GCM; the master key comes from the environment at
//! process start and lives only in memory.
//!
//! # Usage
//!
//! ```no_run
//! use conduit::credentials::{Connection, ConnectionKey, ConnectionStatus, CredentialStore};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let encryption_key = std::env::var("CONDUIT_ENCRYPTION_KEY")?;
//! let store = CredentialStore::new("connections.db", &encryption_key)?;
//!
//! let key = ConnectionKey::new("user1", "github", None);
//! store.upsert(&Connection {
//!     key: key.clone(),
//!     access_token: "gho_access".to_string(),
//!     refresh_token: Some("ghr_refresh".to_string()),
//!     granted_scopes: vec!["repo".to_string()],
//!     expires_at: Some(Utc::now() + Duration::hours(1)),
//!     status: ConnectionStatus::Active,
//! })?;
//!
//! if let Some(conn) = store.get(&key)? {
//!     println!("scopes: {:?}", conn.granted_scopes);
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod storage;

pub use encryption::{decrypt, encrypt, validate_key};
pub use storage::{CredentialStore, StoredConnection};

/// Account label used when a user connects a single account per service.
pub const DEFAULT_ACCOUNT: &str = "default";

/// Composite identity of a connection: one user, one service, one
/// account on that service. A user may hold several accounts per
/// service under distinct labels (e.g., two mailboxes).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub user_id: String,
    pub service: String,
    pub account_label: String,
}

impl ConnectionKey {
    /// Build a key; `account_label = None` selects [`DEFAULT_ACCOUNT`].
    pub fn new(user_id: &str, service: &str, account_label: Option<&str>) -> Self {
        Self {
            user_id: user_id.to_string(),
            service: service.to_string(),
            account_label: account_label.unwrap_or(DEFAULT_ACCOUNT).to_string(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.service, self.account_label)
    }
}

/// Connection lifecycle status.
///
/// `Revoked` and `Invalid` are terminal: no refresh or injection is
/// permitted until a fresh authorization flow replaces the row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Expired,
    Refreshing,
    Invalid,
    Revoked,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Expired => "expired",
            ConnectionStatus::Refreshing => "refreshing",
            ConnectionStatus::Invalid => "invalid",
            ConnectionStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ConnectionStatus::Active),
            "expired" => Some(ConnectionStatus::Expired),
            "refreshing" => Some(ConnectionStatus::Refreshing),
            "invalid" => Some(ConnectionStatus::Invalid),
            "revoked" => Some(ConnectionStatus::Revoked),
            _ => None,
        }
    }

    /// Terminal states require a new authorization flow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Invalid | ConnectionStatus::Revoked)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decrypted OAuth connection as seen by callers of the store.
///
/// Tokens are plaintext here and must never be logged or serialized
/// into responses.
#[derive(Clone, Debug)]
pub struct Connection {
    pub key: ConnectionKey,
    /// Access token used for provider API requests.
    pub access_token: String,
    /// Refresh token, absent for services without rotation.
    pub refresh_token: Option<String>,
    /// Scopes granted by the user during authorization.
    pub granted_scopes: Vec<String>,
    /// Absolute expiry of the access token; absent = non-expiring.
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,
}

impl Connection {
    /// Whether the access token expires within `lookahead` from now.
    /// Non-expiring tokens never report as expiring.
    pub fn expires_within(&self, lookahead: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now() + lookahead,
            None => false,
        }
    }
}
