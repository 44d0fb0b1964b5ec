//! Failure taxonomy for the OAuth connection lifecycle.
//!
//! Every recoverable failure a caller can observe is a variant here.
//! Messages never contain token material.

use std::fmt;

/// Failures surfaced by the authorization flow, refresh coordinator,
/// scope validator, and credential injector.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    /// Callback presented a state token that was never issued, already
    /// consumed, or expired. Possible CSRF attempt.
    StateMismatch,
    /// User declined on the provider's consent screen. A cancellation,
    /// not a system error. The HTTP callback handler resolves denials
    /// inline as a cancellation response; the variant completes the
    /// taxonomy for library callers mapping provider `access_denied`.
    UserDenied,
    /// Service name is not present in the configuration.
    UnknownService(String),
    /// Token endpoint rejected the authorization code. Caller must
    /// restart the authorization flow.
    CodeExchange(String),
    /// Network or 5xx failure during refresh. Connection status is
    /// unchanged; caller may retry with backoff.
    TransientRefresh(String),
    /// Refresh token rejected, or the provider refused a freshly
    /// refreshed credential. Terminal until the user reconnects.
    ReauthorizationRequired,
    /// Action requires scopes the connection was never granted.
    /// Carries the missing scopes so the caller can request them.
    InsufficientScopes(Vec<String>),
    /// No connection exists, or it is revoked/invalid.
    ConnectionUnavailable,
    /// Store, encryption, or serialization failure. Not retryable.
    Internal(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::StateMismatch => {
                write!(f, "Invalid or expired OAuth state (possible CSRF attempt)")
            }
            AuthError::UserDenied => write!(f, "User declined the authorization request"),
            AuthError::UnknownService(name) => write!(f, "Unknown service '{}'", name),
            AuthError::CodeExchange(msg) => {
                write!(f, "Authorization code exchange failed: {}", msg)
            }
            AuthError::TransientRefresh(msg) => {
                write!(f, "Token refresh failed transiently: {}", msg)
            }
            AuthError::ReauthorizationRequired => {
                write!(f, "Connection requires reauthorization")
            }
            AuthError::InsufficientScopes(missing) => {
                write!(f, "Action requires additional scopes: {}", missing.join(" "))
            }
            AuthError::ConnectionUnavailable => {
                write!(f, "No usable connection; connect the service first")
            }
            AuthError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        // Format the whole context chain; store errors never carry
        // plaintext secrets.
        AuthError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_insufficient_scopes() {
        let err = AuthError::InsufficientScopes(vec!["write".to_string(), "admin".to_string()]);
        assert_eq!(
            err.to_string(),
            "Action requires additional scopes: write admin"
        );
    }

    #[test]
    fn test_from_anyhow_keeps_context_chain() {
        let err = anyhow::anyhow!("root cause").context("outer context");
        let auth_err: AuthError = err.into();
        match auth_err {
            AuthError::Internal(msg) => {
                assert!(msg.contains("outer context"));
                assert!(msg.contains("root cause"));
            }
            other => panic!("Expected Internal, got {:?}", other),
        }
    }
}
