use anyhow::{Context, Result};
use conduit::api::{create_router, ApiState};
use conduit::config;
use conduit::credentials::CredentialStore;
use conduit::injector::CredentialInjector;
use conduit::oauth::{run_pending_sweep, AuthFlow, PendingStore, ServiceSet};
use conduit::refresh::RefreshCoordinator;
use conduit::registry::{builtin_capabilities, CapabilityRegistry};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit=info".into()),
        )
        .init();

    let config_path =
        std::env::var("CONDUIT_CONFIG").unwrap_or_else(|_| "conduit.toml".to_string());
    let config = config::load_config(&config_path)?;

    // Key misconfiguration is fatal here, before any request is served
    let encryption_key = config::load_encryption_key()?;
    let store = Arc::new(
        CredentialStore::new(&config.server.store_path, &encryption_key)
            .context("Failed to open connection store")?,
    );

    let services = Arc::new(ServiceSet::from_config(&config)?);
    info!(services = ?services.names(), "Configured services");

    let pending = PendingStore::new(config.pending.ttl_seconds);
    tokio::spawn(run_pending_sweep(
        pending.clone(),
        config.pending.sweep_interval_seconds,
    ));

    let flow = AuthFlow::new(
        store.clone(),
        services.clone(),
        pending,
        &config.server.callback_base_url,
    );

    let refresher = Arc::new(RefreshCoordinator::new(
        store.clone(),
        services,
        config.refresh.lookahead_seconds,
    ));
    let injector = Arc::new(CredentialInjector::new(store.clone(), refresher));

    let mut registry = CapabilityRegistry::new(injector);
    for capability in builtin_capabilities() {
        registry.register(capability);
    }

    let router = create_router(ApiState {
        store,
        flow,
        registry,
        auth_enabled: config.server.auth_enabled,
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Conduit listening");

    axum::serve(listener, router)
        .await
        .context("Server terminated")?;

    Ok(())
}
