//! Token endpoint client.
//!
//! Covers both grant types the lifecycle needs: `authorization_code`
//! (connect) and `refresh_token` (refresh). The trait seam lets tests
//! substitute a scripted endpoint; production uses [`HttpTokenEndpoint`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Tokens issued by a successful grant.
#[derive(Clone, Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes as reported by the provider, when it reports them.
    pub scopes: Option<Vec<String>>,
}

/// Token endpoint failure, classified for retry policy.
#[derive(Debug)]
pub enum TokenEndpointError {
    /// The endpoint rejected the grant (4xx, invalid_grant family).
    /// Not retryable; the credential is dead.
    Rejected(String),
    /// Network failure, timeout, or 5xx. Retryable with backoff;
    /// the stored credential may still be fine.
    Transient(String),
}

impl fmt::Display for TokenEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenEndpointError::Rejected(msg) => write!(f, "Grant rejected: {}", msg),
            TokenEndpointError::Transient(msg) => write!(f, "Transient failure: {}", msg),
        }
    }
}

impl std::error::Error for TokenEndpointError {}

/// Server-side interface to one service's token endpoint.
///
/// Implementations hold the client secret; it never reaches callers or
/// the browser.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchanges an authorization code for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenEndpointError>;

    /// Exchanges a refresh token for a new access token (and possibly
    /// a rotated refresh token).
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenEndpointError>;
}

/// Standard OAuth 2.0 token response.
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_grant(self) -> TokenGrant {
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_in.map(|seconds| Utc::now() + Duration::seconds(seconds)),
            scopes: self
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect()),
        }
    }
}

/// Real token endpoint over HTTPS.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenEndpoint {
    /// `timeout` bounds each exchange; a timed-out refresh is treated
    /// as transient.
    pub fn new(
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    async fn post_grant(
        &self,
        form: HashMap<&str, &str>,
    ) -> Result<TokenGrant, TokenEndpointError> {
        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenEndpointError::Transient(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            // 4xx means the grant itself is bad; 5xx means the provider
            // is having a moment.
            return if status.is_client_error() {
                Err(TokenEndpointError::Rejected(format!("{}: {}", status, body)))
            } else {
                Err(TokenEndpointError::Transient(format!("{}: {}", status, body)))
            };
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            TokenEndpointError::Transient(format!("Failed to parse token response: {}", e))
        })?;

        tracing::debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token grant succeeded"
        );

        Ok(token_response.into_grant())
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, TokenEndpointError> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", redirect_uri);
        form.insert("client_id", self.client_id.as_str());
        form.insert("client_secret", self.client_secret.as_str());

        tracing::debug!(token_url = %self.token_url, "Exchanging authorization code");
        self.post_grant(form).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenEndpointError> {
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        form.insert("client_id", self.client_id.as_str());
        form.insert("client_secret", self.client_secret.as_str());

        tracing::debug!(token_url = %self.token_url, "Refreshing access token");
        self.post_grant(form).await
    }
}
