// Concurrency tests for the refresh coordinator: overlapping callers
// for one connection must collapse into a single refresh exchange.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use conduit::credentials::{Connection, ConnectionKey, ConnectionStatus, CredentialStore};
use conduit::oauth::{ServiceEntry, ServiceSet, TokenEndpoint, TokenEndpointError, TokenGrant};
use conduit::refresh::RefreshCoordinator;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Endpoint that counts refresh exchanges and holds each one open long
/// enough for other callers to pile up behind the connection lock.
struct SlowEndpoint {
    refresh_calls: AtomicUsize,
    delay_ms: u64,
}

#[async_trait]
impl TokenEndpoint for SlowEndpoint {
    async fn exchange_code(
        &self,
        _code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenGrant, TokenEndpointError> {
        unreachable!("Coordinator never exchanges codes")
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, TokenEndpointError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        Ok(TokenGrant {
            access_token: format!("refreshed-{}", n),
            refresh_token: Some(format!("rotated-{}", n)),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            scopes: None,
        })
    }
}

fn setup(delay_ms: u64) -> (Arc<RefreshCoordinator>, Arc<CredentialStore>, Arc<SlowEndpoint>) {
    let master_key = BASE64.encode([0u8; 32]);
    let store = Arc::new(CredentialStore::new(":memory:", &master_key).unwrap());
    let endpoint = Arc::new(SlowEndpoint {
        refresh_calls: AtomicUsize::new(0),
        delay_ms,
    });

    let mut services = ServiceSet::new();
    services.insert(ServiceEntry {
        name: "github".to_string(),
        authorize_endpoint: "https://example.com/authorize".to_string(),
        client_id: "id".to_string(),
        default_scopes: vec![],
        endpoint: endpoint.clone(),
    });

    let coordinator = Arc::new(RefreshCoordinator::new(
        store.clone(),
        Arc::new(services),
        300,
    ));
    (coordinator, store, endpoint)
}

fn seed_expired(store: &CredentialStore, user_id: &str) -> ConnectionKey {
    let key = ConnectionKey::new(user_id, "github", None);
    store
        .upsert(&Connection {
            key: key.clone(),
            access_token: "stale-access".to_string(),
            refresh_token: Some("rt".to_string()),
            granted_scopes: vec!["repo".to_string()],
            expires_at: Some(Utc::now() - Duration::minutes(1)),
            status: ConnectionStatus::Active,
        })
        .unwrap();
    key
}

#[tokio::test]
async fn test_concurrent_refreshes_collapse_to_one_exchange() {
    let (coordinator, store, endpoint) = setup(100);
    let key = seed_expired(&store, "user1");

    let callers = 8;
    let tasks: Vec<_> = (0..callers)
        .map(|_| {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move { coordinator.get_valid_access_token(&key).await })
        })
        .collect();

    let tokens: Vec<String> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    // Exactly one refresh exchange; every caller observes its result
    assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(tokens.len(), callers);
    for token in &tokens {
        assert_eq!(token, "refreshed-1");
    }

    // The rotation landed exactly once in the store
    let stored = store.get(&key).unwrap().unwrap();
    assert_eq!(stored.access_token, "refreshed-1");
    assert_eq!(stored.refresh_token, Some("rotated-1".to_string()));
    assert_eq!(stored.status, ConnectionStatus::Active);
}

#[tokio::test]
async fn test_distinct_connections_refresh_independently() {
    // Serialization shards by connection identity; different users
    // never queue behind each other.
    let (coordinator, store, endpoint) = setup(50);
    let key_a = seed_expired(&store, "alice");
    let key_b = seed_expired(&store, "bob");

    let a = {
        let coordinator = coordinator.clone();
        let key = key_a.clone();
        tokio::spawn(async move { coordinator.get_valid_access_token(&key).await })
    };
    let b = {
        let coordinator = coordinator.clone();
        let key = key_b.clone();
        tokio::spawn(async move { coordinator.get_valid_access_token(&key).await })
    };

    let token_a = a.await.unwrap().unwrap();
    let token_b = b.await.unwrap().unwrap();

    // Two connections, two refreshes
    assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 2);
    assert_ne!(token_a, token_b);
}

#[tokio::test]
async fn test_sequential_calls_after_refresh_are_pure_reads() {
    let (coordinator, store, endpoint) = setup(0);
    let key = seed_expired(&store, "user1");

    let first = coordinator.get_valid_access_token(&key).await.unwrap();
    assert_eq!(first, "refreshed-1");

    // Token is now valid for an hour; no further exchanges
    for _ in 0..3 {
        let token = coordinator.get_valid_access_token(&key).await.unwrap();
        assert_eq!(token, "refreshed-1");
    }
    assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_force_refreshes_collapse() {
    let (coordinator, store, endpoint) = setup(100);
    let key = seed_expired(&store, "user1");

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let coordinator = coordinator.clone();
            let key = key.clone();
            tokio::spawn(async move { coordinator.force_refresh(&key).await })
        })
        .collect();

    let tokens: Vec<String> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    // Overlapping forced refreshes share one exchange; a provider that
    // invalidates the old refresh token on rotation would otherwise
    // strand the losers.
    assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 1);
    for token in &tokens {
        assert_eq!(token, "refreshed-1");
    }
}
