//! Pending-authorization tracking for CSRF protection.
//!
//! Each in-flight authorize redirect holds one entry keyed by a random
//! state token. Entries are single-use and expire after a short TTL if
//! the user abandons the consent screen.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One in-flight authorize redirect.
#[derive(Clone, Debug)]
pub struct PendingAuthorization {
    pub user_id: String,
    pub service: String,
    pub account_label: String,
    pub requested_scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// In-memory store of pending authorizations with automatic expiry.
#[derive(Clone)]
pub struct PendingStore {
    entries: Arc<Mutex<HashMap<String, PendingAuthorization>>>,
    ttl: Duration,
}

impl PendingStore {
    /// `ttl_seconds` - how long a state token remains redeemable
    /// (default configuration: 600 = 10 minutes).
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Creates a pending authorization and returns its state token
    /// (UUID v4, unguessable).
    pub fn create(
        &self,
        user_id: &str,
        service: &str,
        account_label: &str,
        requested_scopes: Vec<String>,
    ) -> String {
        let state_token = Uuid::new_v4().to_string();
        let entry = PendingAuthorization {
            user_id: user_id.to_string(),
            service: service.to_string(),
            account_label: account_label.to_string(),
            requested_scopes,
            created_at: Utc::now(),
        };

        self.entries.lock().unwrap().insert(state_token.clone(), entry);
        state_token
    }

    /// Redeems a state token. Single-use: the entry is removed whether
    /// or not it is still valid, so a replayed token always fails.
    pub fn consume(&self, state_token: &str) -> Option<PendingAuthorization> {
        let entry = self.entries.lock().unwrap().remove(state_token)?;

        if Utc::now() - entry.created_at > self.ttl {
            return None;
        }

        Some(entry)
    }

    /// Drops expired entries. Called periodically by the sweep task.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, entry| now - entry.created_at <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background task that periodically sweeps abandoned authorizations.
pub async fn run_pending_sweep(store: PendingStore, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        store.sweep();
        tracing::debug!(
            pending = store.len(),
            "Pending authorization sweep complete"
        );
    }
}
