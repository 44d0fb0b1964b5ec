//! Static capability registry.
//!
//! Each supported action is a fixed [`Capability`]: a declared scope
//! requirement plus an invoke function, selected by a
//! `(service, action)` lookup table. No generated code, no dynamic
//! endpoint discovery.

use crate::credentials::ConnectionKey;
use crate::injector::{CallError, CredentialInjector, InvokeError};
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One action an agent can perform against a connected service.
///
/// Capabilities are stateless; the registry hands them a valid access
/// token per invocation.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Service this action belongs to (e.g., "github").
    fn service(&self) -> &str;

    /// Action name, unique within the service (e.g., "list_repos").
    fn action(&self) -> &str;

    /// Scopes the connection must have been granted. Checked before
    /// every invocation, not only at connect time.
    fn required_scopes(&self) -> &[&str];

    /// Performs the action against the provider API.
    ///
    /// Must report provider authorization failures (401/403) as
    /// [`CallError::Unauthorized`] so the injector can apply its
    /// refresh-and-retry policy.
    async fn invoke(&self, access_token: &str, params: &Value) -> Result<Value, CallError>;
}

/// Lookup table of capabilities plus the injector that runs them.
pub struct CapabilityRegistry {
    capabilities: HashMap<(String, String), Arc<dyn Capability>>,
    injector: Arc<CredentialInjector>,
}

impl CapabilityRegistry {
    pub fn new(injector: Arc<CredentialInjector>) -> Self {
        Self {
            capabilities: HashMap::new(),
            injector,
        }
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let key = (
            capability.service().to_string(),
            capability.action().to_string(),
        );
        debug!(service = %key.0, action = %key.1, "Registering capability");
        self.capabilities.insert(key, capability);
    }

    pub fn get(&self, service: &str, action: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities
            .get(&(service.to_string(), action.to_string()))
            .cloned()
    }

    /// All registered `(service, action)` pairs, sorted.
    pub fn actions(&self) -> Vec<(String, String)> {
        let mut actions: Vec<_> = self.capabilities.keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Runs a capability for a connection, with scope validation and
    /// the injector's bounded refresh-and-retry policy.
    pub async fn invoke(
        &self,
        key: &ConnectionKey,
        action: &str,
        params: &Value,
    ) -> Result<Value, InvokeError> {
        let capability = self.get(&key.service, action).ok_or_else(|| {
            InvokeError::Upstream(anyhow!(
                "No action '{}' registered for service '{}'",
                action,
                key.service
            ))
        })?;

        let required: Vec<String> = capability
            .required_scopes()
            .iter()
            .map(|s| s.to_string())
            .collect();

        self.injector
            .call(key, &required, |token| {
                let capability = capability.clone();
                let params = params.clone();
                async move { capability.invoke(&token, &params).await }
            })
            .await
    }
}

/// Built-in capabilities shipped with the binary.
pub fn builtin_capabilities() -> Vec<Arc<dyn Capability>> {
    vec![Arc::new(github::ListRepos::new())]
}

pub mod github {
    //! GitHub reference capability.

    use super::*;
    use serde::Deserialize;

    const BASE_URL: &str = "https://api.github.com";
    const USER_AGENT: &str = "conduit/0.1";

    #[derive(Debug, Deserialize, serde::Serialize)]
    struct Repo {
        name: String,
        full_name: String,
        description: Option<String>,
        private: bool,
        open_issues_count: u64,
        updated_at: String,
    }

    /// Lists the authenticated user's repositories, most recently
    /// updated first.
    pub struct ListRepos {
        client: reqwest::Client,
        base_url: String,
    }

    impl ListRepos {
        pub fn new() -> Self {
            Self::with_base_url(BASE_URL.to_string())
        }

        /// Custom API base URL (for testing with a mock server).
        pub fn with_base_url(base_url: String) -> Self {
            let client = reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default();
            Self { client, base_url }
        }
    }

    impl Default for ListRepos {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Capability for ListRepos {
        fn service(&self) -> &str {
            "github"
        }

        fn action(&self) -> &str {
            "list_repos"
        }

        fn required_scopes(&self) -> &[&str] {
            &["repo"]
        }

        async fn invoke(&self, access_token: &str, params: &Value) -> Result<Value, CallError> {
            let per_page = params
                .get("per_page")
                .and_then(Value::as_u64)
                .unwrap_or(30)
                .min(100);
            let url = format!(
                "{}/user/repos?sort=updated&per_page={}",
                self.base_url, per_page
            );

            let response = self
                .client
                .get(&url)
                .bearer_auth(access_token)
                .header("Accept", "application/vnd.github+json")
                .send()
                .await
                .map_err(|e| CallError::Other(anyhow!("GitHub request failed: {}", e)))?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(CallError::Unauthorized);
            }
            if !status.is_success() {
                return Err(CallError::Other(anyhow!(
                    "GitHub returned {} for {}",
                    status,
                    url
                )));
            }

            let repos: Vec<Repo> = response
                .json()
                .await
                .map_err(|e| CallError::Other(anyhow!("Failed to parse repos: {}", e)))?;

            serde_json::to_value(repos)
                .map_err(|e| CallError::Other(anyhow!("Failed to serialize repos: {}", e)))
        }
    }
}
