//! In-memory credential and user store, for tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::middleware::auth::{
    hash_token, CredentialRecord, CredentialStore, StoreError, UserRecord, UserStore,
};

#[derive(Debug, Clone)]
struct StoredToken {
    user_id: i64,
    scope: String,
    expiry: DateTime<Utc>,
}

/// Store backed by hash maps. Tokens are keyed by their hex-encoded hash.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tokens: RwLock<HashMap<String, StoredToken>>,
    users: RwLock<HashMap<i64, UserRecord>>,
    latency: Option<Duration>,
    lookups: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every lookup by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert_user<I, P>(&self, id: i64, activated: bool, permissions: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.users.write().insert(
            id,
            UserRecord {
                id,
                activated,
                permissions: permissions.into_iter().map(Into::into).collect(),
            },
        );
    }

    /// Store a token under the hash of `plaintext`.
    pub fn insert_token(&self, plaintext: &str, user_id: i64, scope: &str, expiry: DateTime<Utc>) {
        self.tokens.write().insert(
            hex::encode(hash_token(plaintext)),
            StoredToken {
                user_id,
                scope: scope.to_string(),
                expiry,
            },
        );
    }

    pub fn token_count(&self) -> usize {
        self.tokens.read().len()
    }

    /// Number of store calls served so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    async fn simulate_latency(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn lookup(&self, token_hash: &[u8], scope: &str) -> Result<Option<CredentialRecord>, StoreError> {
        self.simulate_latency().await;

        let tokens = self.tokens.read();
        Ok(tokens
            .get(&hex::encode(token_hash))
            .filter(|token| token.scope == scope)
            .map(|token| CredentialRecord {
                user_id: token.user_id,
                expiry: token.expiry,
            }))
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_by_id(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
        self.simulate_latency().await;
        Ok(self.users.read().get(&user_id).cloned())
    }
}
