//! Configuration loading.
//!
//! Services, server settings, and refresh policy come from a TOML
//! file. Client secrets may live in the file or in
//! `CONDUIT_OAUTH_{SERVICE}_CLIENT_SECRET` environment variables;
//! the credential encryption key comes only from
//! `CONDUIT_ENCRYPTION_KEY` and is never written to config.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Environment variable holding the base64 32-byte master key.
pub const ENCRYPTION_KEY_ENV: &str = "CONDUIT_ENCRYPTION_KEY";

/// Complete Conduit configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConduitConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub pending: PendingConfig,
    /// Per-service OAuth settings, keyed by service name.
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Base URL the provider redirects back to; the callback path is
    /// appended per service.
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// When false, requests without a bearer token act as user "default"
    /// (local single-user runs).
    #[serde(default = "default_auth_enabled")]
    pub auth_enabled: bool,
    /// Path to the SQLite connection store.
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_auth_enabled() -> bool {
    true
}

fn default_store_path() -> String {
    "connections.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            callback_base_url: default_callback_base_url(),
            auth_enabled: default_auth_enabled(),
            store_path: default_store_path(),
        }
    }
}

/// Refresh policy
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Proactive refresh threshold: tokens expiring within this window
    /// are refreshed before being handed out.
    #[serde(default = "default_lookahead_seconds")]
    pub lookahead_seconds: i64,
    /// Timeout for token endpoint calls; a timed-out attempt counts as
    /// a transient failure.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

fn default_lookahead_seconds() -> i64 {
    300
}

fn default_http_timeout_seconds() -> u64 {
    10
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lookahead_seconds: default_lookahead_seconds(),
            http_timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

/// Pending-authorization policy
#[derive(Debug, Clone, Deserialize)]
pub struct PendingConfig {
    /// How long an authorize redirect stays redeemable.
    #[serde(default = "default_pending_ttl_seconds")]
    pub ttl_seconds: i64,
    /// How often abandoned redirects are swept.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_pending_ttl_seconds() -> i64 {
    600
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_pending_ttl_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

/// One service's OAuth settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub client_id: String,
    /// Prefer the environment variable; the TOML field exists for
    /// local development.
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub default_scopes: Vec<String>,
}

impl ServiceConfig {
    /// Resolves the client secret: config value first, then
    /// `CONDUIT_OAUTH_{SERVICE}_CLIENT_SECRET`.
    pub fn resolve_client_secret(&self, service_name: &str) -> Result<String> {
        if let Some(secret) = &self.client_secret {
            return Ok(secret.clone());
        }

        let var = format!(
            "CONDUIT_OAUTH_{}_CLIENT_SECRET",
            service_name.to_uppercase().replace('-', "_")
        );
        std::env::var(&var)
            .map_err(|_| anyhow!("No client secret for '{}': set {}", service_name, var))
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<ConduitConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path))?;
    let config: ConduitConfig =
        toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}

/// Read the base64 master key from the environment.
///
/// Key misconfiguration is fatal at startup, never discovered at
/// request time.
pub fn load_encryption_key() -> Result<String> {
    std::env::var(ENCRYPTION_KEY_ENV)
        .map_err(|_| anyhow!("{} must be set (base64, 32 bytes)", ENCRYPTION_KEY_ENV))
}
