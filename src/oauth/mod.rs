//! OAuth 2.0 authorization-code flow.
//!
//! 1. Agent or UI asks to connect a service
//! 2. `begin_authorization` returns the provider authorize URL
//! 3. User consents on the provider's site
//! 4. Provider redirects back with `code` + `state`
//! 5. `complete_authorization` validates the state, exchanges the code
//!    server-side, and upserts an active connection
//!
//! The state token is single-use and expires if the user abandons the
//! consent screen; an unknown or replayed state is rejected outright.

pub mod exchange;
pub mod pending;

pub use exchange::{HttpTokenEndpoint, TokenEndpoint, TokenEndpointError, TokenGrant};
pub use pending::{run_pending_sweep, PendingAuthorization, PendingStore};

use crate::config::ConduitConfig;
use crate::credentials::{Connection, ConnectionKey, ConnectionStatus, CredentialStore};
use crate::error::AuthError;
use crate::scopes;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One configured service: authorize endpoint, public client settings,
/// and the token endpoint client holding the secret.
pub struct ServiceEntry {
    pub name: String,
    pub authorize_endpoint: String,
    pub client_id: String,
    pub default_scopes: Vec<String>,
    pub endpoint: Arc<dyn TokenEndpoint>,
}

impl ServiceEntry {
    /// Builds the authorize redirect URL.
    pub fn authorize_url(&self, state_token: &str, redirect_uri: &str, scopes: &[String]) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.authorize_endpoint,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" ")),
            urlencoding::encode(state_token)
        )
    }
}

/// All configured services, keyed by name.
#[derive(Default)]
pub struct ServiceSet {
    services: HashMap<String, ServiceEntry>,
}

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the set from configuration, constructing one HTTP token
    /// endpoint per service. Fails if any service lacks a client secret.
    pub fn from_config(config: &ConduitConfig) -> Result<Self> {
        let timeout = std::time::Duration::from_secs(config.refresh.http_timeout_seconds);
        let mut set = Self::new();

        for (name, service) in &config.services {
            let secret = service.resolve_client_secret(name)?;
            let endpoint = HttpTokenEndpoint::new(
                &service.token_endpoint,
                &service.client_id,
                &secret,
                timeout,
            )?;
            set.insert(ServiceEntry {
                name: name.clone(),
                authorize_endpoint: service.authorize_endpoint.clone(),
                client_id: service.client_id.clone(),
                default_scopes: service.default_scopes.clone(),
                endpoint: Arc::new(endpoint),
            });
        }

        Ok(set)
    }

    pub fn insert(&mut self, entry: ServiceEntry) {
        self.services.insert(entry.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Result<&ServiceEntry, AuthError> {
        self.services
            .get(name)
            .ok_or_else(|| AuthError::UnknownService(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Orchestrates the authorize-redirect / callback / code-exchange
/// protocol. Creates connections; never refreshes them.
pub struct AuthFlow {
    store: Arc<CredentialStore>,
    services: Arc<ServiceSet>,
    pending: PendingStore,
    callback_base_url: String,
}

impl AuthFlow {
    pub fn new(
        store: Arc<CredentialStore>,
        services: Arc<ServiceSet>,
        pending: PendingStore,
        callback_base_url: &str,
    ) -> Self {
        Self {
            store,
            services,
            pending,
            callback_base_url: callback_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Redirect URI registered with the provider for `service`. Must be
    /// identical in the authorize request and the code exchange.
    pub fn redirect_uri(&self, service: &str) -> String {
        format!("{}/api/services/{}/oauth/callback", self.callback_base_url, service)
    }

    /// Starts a connect flow: records a pending authorization under a
    /// fresh state token and returns the provider authorize URL.
    ///
    /// Requests the union of already-granted scopes and `requested_scopes`
    /// (falling back to the service defaults), so incremental consent
    /// never narrows an existing grant. Touches no secrets.
    pub fn begin_authorization(
        &self,
        user_id: &str,
        service: &str,
        account_label: Option<&str>,
        requested_scopes: Vec<String>,
    ) -> Result<String, AuthError> {
        let entry = self.services.get(service)?;

        let requested = if requested_scopes.is_empty() {
            entry.default_scopes.clone()
        } else {
            requested_scopes
        };

        let key = ConnectionKey::new(user_id, service, account_label);
        let already_granted = match self.store.get(&key)? {
            Some(existing) => existing.granted_scopes,
            None => Vec::new(),
        };
        let scopes = scopes::union_scopes(&already_granted, &requested);

        let state_token = self
            .pending
            .create(user_id, service, &key.account_label, scopes.clone());
        let url = entry.authorize_url(&state_token, &self.redirect_uri(service), &scopes);

        info!(
            user_id = %user_id,
            service = %service,
            scopes = %scopes.join(" "),
            "Authorization flow started"
        );

        Ok(url)
    }

    /// Completes a connect flow from the provider callback.
    ///
    /// Consumes the pending authorization (rejecting unknown, replayed,
    /// or expired states), exchanges the code server-side, and upserts
    /// an active connection under the user, service, and account label
    /// recorded at start. The upsert is the only visible side effect:
    /// if it fails, no connection exists and the caller restarts the
    /// whole flow.
    pub async fn complete_authorization(
        &self,
        service: &str,
        returned_state: &str,
        code: &str,
    ) -> Result<Connection, AuthError> {
        let entry = self.services.get(service)?;

        let pending = self.pending.consume(returned_state).ok_or_else(|| {
            warn!(service = %service, "Callback with unknown or expired state");
            AuthError::StateMismatch
        })?;

        // The state must have been issued for this service
        if pending.service != service {
            warn!(
                expected = %pending.service,
                actual = %service,
                "Callback service does not match pending authorization"
            );
            return Err(AuthError::StateMismatch);
        }

        debug!(service = %service, user_id = %pending.user_id, "Exchanging authorization code");

        let grant = entry
            .endpoint
            .exchange_code(code, &self.redirect_uri(service))
            .await
            .map_err(|e| AuthError::CodeExchange(e.to_string()))?;

        // Prefer the provider's own scope report when present
        let granted_scopes = grant.scopes.unwrap_or(pending.requested_scopes);

        let connection = Connection {
            key: ConnectionKey::new(&pending.user_id, service, Some(&pending.account_label)),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            granted_scopes,
            expires_at: grant.expires_at,
            status: ConnectionStatus::Active,
        };

        self.store.upsert(&connection)?;

        info!(
            user_id = %pending.user_id,
            service = %service,
            has_refresh_token = connection.refresh_token.is_some(),
            "Connection established"
        );

        Ok(connection)
    }

    /// Handles a user denial callback: discards the pending
    /// authorization so the state token cannot be replayed.
    pub fn deny_authorization(&self, returned_state: &str) {
        if self.pending.consume(returned_state).is_some() {
            info!("Authorization declined by user");
        }
    }

    /// Marks a connection revoked. Terminal: later token requests fail
    /// until a fresh flow replaces the row.
    pub fn disconnect(&self, key: &ConnectionKey) -> Result<bool, AuthError> {
        let revoked = self.store.set_status(key, ConnectionStatus::Revoked)?;
        if revoked {
            info!(connection = %key, "Connection revoked");
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::{Duration, Utc};

    struct ScriptedEndpoint {
        grant: TokenGrant,
        fail: bool,
    }

    #[async_trait]
    impl TokenEndpoint for ScriptedEndpoint {
        async fn exchange_code(
            &self,
            _code: &str,
            _redirect_uri: &str,
        ) -> Result<TokenGrant, TokenEndpointError> {
            if self.fail {
                Err(TokenEndpointError::Rejected("bad_verification_code".to_string()))
            } else {
                Ok(self.grant.clone())
            }
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, TokenEndpointError> {
            unreachable!("AuthFlow never refreshes")
        }
    }

    fn test_store() -> Arc<CredentialStore> {
        let key = BASE64.encode([0u8; 32]);
        Arc::new(CredentialStore::new(":memory:", &key).unwrap())
    }

    fn test_flow(fail_exchange: bool) -> AuthFlow {
        let grant = TokenGrant {
            access_token: "fresh-access".to_string(),
            refresh_token: Some("fresh-refresh".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            scopes: None,
        };
        let mut services = ServiceSet::new();
        services.insert(ServiceEntry {
            name: "github".to_string(),
            authorize_endpoint: "https://github.com/login/oauth/authorize".to_string(),
            client_id: "client123".to_string(),
            default_scopes: vec!["repo".to_string()],
            endpoint: Arc::new(ScriptedEndpoint { grant, fail: fail_exchange }),
        });

        AuthFlow::new(
            test_store(),
            Arc::new(services),
            PendingStore::new(600),
            "http://localhost:8080",
        )
    }

    fn state_from_url(url: &str) -> String {
        url.split("state=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_begin_authorization_builds_url() {
        let flow = test_flow(false);
        let url = flow
            .begin_authorization("user1", "github", None, vec![])
            .unwrap();

        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("client_id=client123"));
        assert!(url.contains("response_type=code"));
        // Default scopes used when none requested
        assert!(url.contains("scope=repo"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fapi%2Fservices%2Fgithub%2Foauth%2Fcallback"
        ));
    }

    #[test]
    fn test_begin_authorization_unknown_service() {
        let flow = test_flow(false);
        let err = flow
            .begin_authorization("user1", "nope", None, vec![])
            .unwrap_err();
        assert_eq!(err, AuthError::UnknownService("nope".to_string()));
    }

    #[tokio::test]
    async fn test_complete_authorization_creates_connection() {
        let flow = test_flow(false);
        let url = flow
            .begin_authorization("user1", "github", None, vec!["repo".to_string()])
            .unwrap();
        let state = state_from_url(&url);

        let connection = flow
            .complete_authorization("github", &state, "auth-code")
            .await
            .unwrap();

        assert_eq!(connection.access_token, "fresh-access");
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert_eq!(connection.granted_scopes, vec!["repo".to_string()]);

        let stored = flow
            .store
            .get(&ConnectionKey::new("user1", "github", None))
            .unwrap()
            .unwrap();
        assert_eq!(stored.access_token, "fresh-access");
    }

    #[tokio::test]
    async fn test_callback_with_unknown_state_rejected() {
        let flow = test_flow(false);
        let err = flow
            .complete_authorization("github", "never-issued", "code")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::StateMismatch);

        // And no connection was created
        assert!(flow
            .store
            .get(&ConnectionKey::new("user1", "github", None))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_state_cannot_be_replayed() {
        let flow = test_flow(false);
        let url = flow
            .begin_authorization("user1", "github", None, vec![])
            .unwrap();
        let state = state_from_url(&url);

        flow.complete_authorization("github", &state, "code")
            .await
            .unwrap();

        let err = flow
            .complete_authorization("github", &state, "code")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::StateMismatch);
    }

    #[tokio::test]
    async fn test_code_exchange_failure_surfaces() {
        let flow = test_flow(true);
        let url = flow
            .begin_authorization("user1", "github", None, vec![])
            .unwrap();
        let state = state_from_url(&url);

        match flow
            .complete_authorization("github", &state, "stale-code")
            .await
        {
            Err(AuthError::CodeExchange(msg)) => assert!(msg.contains("bad_verification_code")),
            other => panic!("Expected CodeExchange, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_requests_scope_union() {
        let flow = test_flow(false);

        // First grant: repo only
        let url = flow
            .begin_authorization("user1", "github", None, vec!["repo".to_string()])
            .unwrap();
        let state = state_from_url(&url);
        flow.complete_authorization("github", &state, "code")
            .await
            .unwrap();

        // Incremental connect for workflow keeps repo in the request
        let url = flow
            .begin_authorization("user1", "github", None, vec!["workflow".to_string()])
            .unwrap();
        assert!(url.contains("scope=repo%20workflow"));
    }

    #[tokio::test]
    async fn test_account_label_flows_through_callback() {
        let flow = test_flow(false);

        // Existing default-account connection
        flow.store
            .upsert(&Connection {
                key: ConnectionKey::new("user1", "github", None),
                access_token: "default-access".to_string(),
                refresh_token: None,
                granted_scopes: vec!["repo".to_string()],
                expires_at: None,
                status: ConnectionStatus::Active,
            })
            .unwrap();

        // Connect a second, work-labelled account
        let url = flow
            .begin_authorization("user1", "github", Some("work"), vec![])
            .unwrap();
        let state = state_from_url(&url);
        let connection = flow
            .complete_authorization("github", &state, "code")
            .await
            .unwrap();
        assert_eq!(connection.key.account_label, "work");

        let work = flow
            .store
            .get(&ConnectionKey::new("user1", "github", Some("work")))
            .unwrap()
            .unwrap();
        assert_eq!(work.access_token, "fresh-access");

        // The default account's credentials are untouched
        let default = flow
            .store
            .get(&ConnectionKey::new("user1", "github", None))
            .unwrap()
            .unwrap();
        assert_eq!(default.access_token, "default-access");
    }

    #[tokio::test]
    async fn test_disconnect_marks_revoked() {
        let flow = test_flow(false);
        let url = flow
            .begin_authorization("user1", "github", None, vec![])
            .unwrap();
        let state = state_from_url(&url);
        flow.complete_authorization("github", &state, "code")
            .await
            .unwrap();

        let key = ConnectionKey::new("user1", "github", None);
        assert!(flow.disconnect(&key).unwrap());

        let stored = flow.store.get(&key).unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Revoked);
    }
}
