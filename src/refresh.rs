//! Token refresh coordination.
//!
//! Keeps access tokens valid without user involvement. Refresh is a
//! critical section keyed by connection identity: overlapping callers
//! collapse into a single in-flight refresh and all observe its result.
//! Providers may invalidate the prior refresh token on rotation, so a
//! duplicate concurrent refresh could strand every other caller with a
//! dead token.

use crate::credentials::{Connection, ConnectionKey, ConnectionStatus, CredentialStore};
use crate::error::AuthError;
use crate::oauth::{ServiceSet, TokenEndpointError};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Access token handed to a caller, with a note of whether this logical
/// call already spent its refresh round-trip.
pub struct LeasedToken {
    pub token: String,
    pub refreshed: bool,
}

/// Serializes refreshes per connection and applies the refresh state
/// machine: active → expired → refreshing → active, or → invalid when
/// the provider rejects the refresh token.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    services: Arc<ServiceSet>,
    /// Proactive refresh threshold.
    lookahead: Duration,
    /// One async mutex per connection identity. No global lock; all
    /// serialization shards by key.
    locks: DashMap<ConnectionKey, Arc<Mutex<()>>>,
    /// Completion time of the last successful refresh per connection,
    /// used to collapse callers that queued behind an in-flight refresh.
    last_refresh: DashMap<ConnectionKey, DateTime<Utc>>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, services: Arc<ServiceSet>, lookahead_seconds: i64) -> Self {
        Self {
            store,
            services,
            lookahead: Duration::seconds(lookahead_seconds),
            locks: DashMap::new(),
            last_refresh: DashMap::new(),
        }
    }

    /// Returns a currently valid access token, refreshing first when
    /// the token is expired or expires within the lookahead window.
    pub async fn get_valid_access_token(&self, key: &ConnectionKey) -> Result<String, AuthError> {
        Ok(self.obtain(key, false).await?.token)
    }

    /// Unconditionally refreshes and returns the new token. Used
    /// reactively after a provider rejected the current one.
    pub async fn force_refresh(&self, key: &ConnectionKey) -> Result<String, AuthError> {
        Ok(self.obtain(key, true).await?.token)
    }

    /// Shared path for both entry points. `force` skips the freshness
    /// check but still collapses into a refresh that completed while
    /// this caller was queued on the connection's lock.
    pub(crate) async fn obtain(&self, key: &ConnectionKey, force: bool) -> Result<LeasedToken, AuthError> {
        let connection = self.load_usable(key)?;

        if !force && !connection.expires_within(self.lookahead) {
            return Ok(LeasedToken {
                token: connection.access_token,
                refreshed: false,
            });
        }

        // Services without token rotation cannot self-heal
        if connection.refresh_token.is_none() {
            let hard_expired = connection
                .expires_at
                .map(|at| at <= Utc::now())
                .unwrap_or(false);
            if force || hard_expired {
                debug!(connection = %key, "No refresh token; reauthorization required");
                return Err(AuthError::ReauthorizationRequired);
            }
            // Inside the lookahead window but still valid and not
            // refreshable: hand out what we have.
            return Ok(LeasedToken {
                token: connection.access_token,
                refreshed: false,
            });
        }

        let entered_at = Utc::now();
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-read under the lock: a caller we queued behind may have
        // already refreshed this connection.
        let connection = self.load_usable(key)?;

        let refreshed_while_queued = self
            .last_refresh
            .get(key)
            .map(|at| *at >= entered_at)
            .unwrap_or(false);
        if refreshed_while_queued || (!force && !connection.expires_within(self.lookahead)) {
            return Ok(LeasedToken {
                token: connection.access_token,
                refreshed: false,
            });
        }

        self.refresh_locked(key, &connection).await
    }

    /// Performs one refresh exchange. Caller holds the connection lock.
    async fn refresh_locked(
        &self,
        key: &ConnectionKey,
        connection: &Connection,
    ) -> Result<LeasedToken, AuthError> {
        let entry = self.services.get(&key.service)?;
        let refresh_token = connection
            .refresh_token
            .as_deref()
            .ok_or(AuthError::ReauthorizationRequired)?;

        self.store.set_status(key, ConnectionStatus::Refreshing)?;
        debug!(connection = %key, "Refreshing access token");

        match entry.endpoint.refresh(refresh_token).await {
            Ok(grant) => {
                if let (Some(old), Some(new)) = (connection.expires_at, grant.expires_at) {
                    if new <= old {
                        warn!(connection = %key, "Refreshed token does not extend validity window");
                    }
                }
                self.store.apply_refresh(
                    key,
                    &grant.access_token,
                    grant.refresh_token.as_deref(),
                    grant.expires_at,
                )?;
                self.last_refresh.insert(key.clone(), Utc::now());

                info!(
                    connection = %key,
                    rotated_refresh_token = grant.refresh_token.is_some(),
                    "Token refreshed"
                );

                Ok(LeasedToken {
                    token: grant.access_token,
                    refreshed: true,
                })
            }
            Err(TokenEndpointError::Rejected(msg)) => {
                // Refresh token is dead; terminal until the user reconnects
                warn!(connection = %key, reason = %msg, "Refresh token rejected");
                self.store.set_status(key, ConnectionStatus::Invalid)?;
                Err(AuthError::ReauthorizationRequired)
            }
            Err(TokenEndpointError::Transient(msg)) => {
                // Leave the credential as it was; caller retries with backoff
                warn!(connection = %key, reason = %msg, "Transient refresh failure");
                let fallback = if connection
                    .expires_at
                    .map(|at| at <= Utc::now())
                    .unwrap_or(false)
                {
                    ConnectionStatus::Expired
                } else {
                    ConnectionStatus::Active
                };
                self.store.set_status(key, fallback)?;
                Err(AuthError::TransientRefresh(msg))
            }
        }
    }

    /// Loads a connection that is allowed to serve tokens. Missing,
    /// revoked, and invalid connections are indistinguishable to the
    /// caller: reconnect. Their lock-map entries are dropped here, so
    /// deleted and disconnected identities do not pin map entries
    /// forever.
    fn load_usable(&self, key: &ConnectionKey) -> Result<Connection, AuthError> {
        let Some(connection) = self.store.get(key)? else {
            self.evict(key);
            return Err(AuthError::ConnectionUnavailable);
        };

        if connection.status.is_terminal() {
            self.evict(key);
            return Err(AuthError::ConnectionUnavailable);
        }

        Ok(connection)
    }

    fn evict(&self, key: &ConnectionKey) {
        self.locks.remove(key);
        self.last_refresh.remove(key);
    }
}
