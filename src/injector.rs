//! Credential injection for outbound provider calls.
//!
//! Wraps an arbitrary request closure with scope validation, a valid
//! access token, and a bounded retry policy: on an authorization
//! failure from the provider, exactly one forced refresh and one retry.
//! A second rejection marks the connection invalid and surfaces
//! `ReauthorizationRequired` — never an open-ended retry loop against a
//! genuinely revoked credential.

use crate::credentials::{ConnectionKey, ConnectionStatus, CredentialStore};
use crate::error::AuthError;
use crate::refresh::RefreshCoordinator;
use crate::scopes;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Failure of a wrapped provider call.
#[derive(Debug)]
pub enum CallError {
    /// The provider rejected the credential (HTTP 401/403). Triggers
    /// the refresh-and-retry policy.
    Unauthorized,
    /// Any other failure; passed through to the caller untouched.
    Other(anyhow::Error),
}

/// Failure of an injected call: either the credential machinery failed,
/// or the provider call itself failed for non-authorization reasons.
#[derive(Debug)]
pub enum InvokeError {
    Auth(AuthError),
    Upstream(anyhow::Error),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::Auth(err) => write!(f, "{}", err),
            InvokeError::Upstream(err) => write!(f, "Provider call failed: {:#}", err),
        }
    }
}

impl std::error::Error for InvokeError {}

impl From<AuthError> for InvokeError {
    fn from(err: AuthError) -> Self {
        InvokeError::Auth(err)
    }
}

/// Wraps outbound provider calls with the current access token.
pub struct CredentialInjector {
    store: Arc<CredentialStore>,
    refresher: Arc<RefreshCoordinator>,
}

impl CredentialInjector {
    pub fn new(store: Arc<CredentialStore>, refresher: Arc<RefreshCoordinator>) -> Self {
        Self { store, refresher }
    }

    /// Runs `request` with a valid access token.
    ///
    /// Guarantees: at most one refresh-endpoint round-trip per logical
    /// call, and the wrapped request is attempted at most twice. A
    /// revoked or invalid connection fails before any network I/O.
    pub async fn call<T, F, Fut>(
        &self,
        key: &ConnectionKey,
        required_scopes: &[String],
        request: F,
    ) -> Result<T, InvokeError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let connection = self
            .store
            .get(key)
            .map_err(AuthError::from)?
            .ok_or(AuthError::ConnectionUnavailable)?;
        if connection.status.is_terminal() {
            return Err(AuthError::ConnectionUnavailable.into());
        }

        scopes::ensure_scopes(&connection, required_scopes)?;

        let lease = self.refresher.obtain(key, false).await?;

        match request(lease.token).await {
            Ok(value) => Ok(value),
            Err(CallError::Other(err)) => Err(InvokeError::Upstream(err)),
            Err(CallError::Unauthorized) => {
                if lease.refreshed {
                    // The provider just rejected a token we refreshed in
                    // this very call; a second refresh cannot help.
                    warn!(connection = %key, "Freshly refreshed token rejected by provider");
                    self.mark_invalid(key)?;
                    return Err(AuthError::ReauthorizationRequired.into());
                }

                debug!(connection = %key, "Provider rejected token; forcing refresh");
                let token = self.refresher.force_refresh(key).await?;

                match request(token).await {
                    Ok(value) => Ok(value),
                    Err(CallError::Other(err)) => Err(InvokeError::Upstream(err)),
                    Err(CallError::Unauthorized) => {
                        warn!(
                            connection = %key,
                            "Provider rejected token twice; connection needs reauthorization"
                        );
                        self.mark_invalid(key)?;
                        Err(AuthError::ReauthorizationRequired.into())
                    }
                }
            }
        }
    }

    fn mark_invalid(&self, key: &ConnectionKey) -> Result<(), AuthError> {
        self.store.set_status(key, ConnectionStatus::Invalid)?;
        Ok(())
    }
}
