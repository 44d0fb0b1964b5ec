// OAuth connection manager: connect user accounts to third-party
// services and hand valid credentials to automated agents.

// Connection model and encrypted storage
pub mod credentials;

// Authorization-code flow and token endpoint clients
pub mod oauth;

// Token refresh coordination (single-flight per connection)
pub mod refresh;

// Scope validation
pub mod scopes;

// Credential injection with bounded retry
pub mod injector;

// Static capability registry
pub mod registry;

// HTTP API
pub mod api;

// Bearer-token user identification
pub mod auth;

// Configuration
pub mod config;

// Failure taxonomy
pub mod error;
