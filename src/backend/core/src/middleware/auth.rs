//! Authentication middleware.
//!
//! Features:
//! - Opaque bearer tokens validated against a [`CredentialStore`]
//! - Identity snapshots (activation flag + permission codes) from a [`UserStore`]
//! - Anonymous identity for requests without credentials
//! - Deadline-bounded store lookups
//! - Request context injection
//!
//! # Example
//!
//! ```rust,ignore
//! use greenlight_core::middleware::auth::{AuthConfig, AuthLayer, IdentityResolver};
//!
//! let resolver = Arc::new(IdentityResolver::new(db.clone(), db.clone(), AuthConfig::default()));
//!
//! let app = Router::new()
//!     .route("/v1/movies", get(list_movies))
//!     .layer(AuthLayer::new(resolver));
//! ```

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::{header, request::Parts, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeSet,
    future::Future,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tower::{Layer, Service};
use tracing::debug;

use super::recovery::RequestId;
use crate::error::AppError;

/// Scope of tokens accepted for request authentication.
pub const AUTHENTICATION_SCOPE: &str = "authentication";

/// Length of a plaintext token: 16 random bytes, base32 without padding.
pub const TOKEN_PLAINTEXT_LEN: usize = 26;

// ═══════════════════════════════════════════════════════════════════════════════
// Identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable snapshot of who is making a request.
///
/// Loaded once per request. Shared behind an `Arc`, so tasks spawned from the
/// request can read it without locking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    id: Option<i64>,
    activated: bool,
    permissions: BTreeSet<String>,
}

impl Identity {
    /// The unauthenticated caller.
    pub fn anonymous() -> Self {
        Self {
            id: None,
            activated: false,
            permissions: BTreeSet::new(),
        }
    }

    /// An authenticated user.
    pub fn authenticated<I, P>(id: i64, activated: bool, permissions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            id: Some(id),
            activated,
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_none()
    }

    pub fn user_id(&self) -> Option<i64> {
        self.id
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn has_permission(&self, code: &str) -> bool {
        self.permissions.contains(code)
    }

    pub fn permissions(&self) -> impl Iterator<Item = &str> {
        self.permissions.iter().map(String::as_str)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Request Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-request carrier, inserted into request extensions by [`AuthLayer`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub identity: Arc<Identity>,
}

impl RequestContext {
    pub fn new(request_id: RequestId, identity: Identity) -> Self {
        Self {
            request_id,
            identity: Arc::new(identity),
        }
    }

    /// Context for an unauthenticated caller.
    pub fn anonymous(request_id: RequestId) -> Self {
        Self::new(request_id, Identity::anonymous())
    }
}

/// Extractor for the request context in handlers.
#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or_else(|| AppError::unexpected("request context missing, is AuthLayer installed?"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Contracts
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures of the backing stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// A stored token, as returned by [`CredentialStore::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub user_id: i64,
    pub expiry: DateTime<Utc>,
}

/// The authorization-relevant part of a user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub activated: bool,
    pub permissions: Vec<String>,
}

/// Token lookup by SHA-256 hash and scope.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, token_hash: &[u8], scope: &str) -> Result<Option<CredentialRecord>, StoreError>;
}

/// User lookup by id.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError>;
}

/// SHA-256 of a plaintext token, the form tokens are stored in.
pub fn hash_token(plaintext: &str) -> [u8; 32] {
    Sha256::digest(plaintext.as_bytes()).into()
}

/// Whether `token` has the shape of a plaintext token.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_PLAINTEXT_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}

/// Extract the bearer credential from the `Authorization` header.
///
/// A missing header is `Ok(None)`; a header that is not `Bearer <token>` is
/// rejected outright.
pub fn bearer_credential(headers: &HeaderMap) -> Result<Option<&str>, AppError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(Some)
        .ok_or(AppError::InvalidCredential)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Upper bound for each store lookup
    #[serde(with = "humantime_serde")]
    pub lookup_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_secs(3),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Identity Resolver
// ═══════════════════════════════════════════════════════════════════════════════

/// Turns a bearer credential into an [`Identity`].
///
/// Resolution is a pure read: nothing in the stores is modified.
pub struct IdentityResolver {
    credentials: Arc<dyn CredentialStore>,
    users: Arc<dyn UserStore>,
    config: AuthConfig,
}

impl IdentityResolver {
    /// Create a new resolver.
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        users: Arc<dyn UserStore>,
        config: AuthConfig,
    ) -> Self {
        Self {
            credentials,
            users,
            config,
        }
    }

    /// Resolve a credential.
    ///
    /// No credential yields the anonymous identity. A malformed, unknown or
    /// expired credential fails with [`AppError::InvalidCredential`].
    pub async fn resolve(&self, credential: Option<&str>) -> Result<Identity, AppError> {
        let Some(token) = credential else {
            return Ok(Identity::anonymous());
        };

        if !is_well_formed(token) {
            return Err(reject("malformed"));
        }

        let hash = hash_token(token);
        let record = self
            .bounded(self.credentials.lookup(&hash, AUTHENTICATION_SCOPE))
            .await?
            .ok_or_else(|| reject("unknown"))?;

        if record.expiry <= Utc::now() {
            return Err(reject("expired"));
        }

        let user = self
            .bounded(self.users.get_by_id(record.user_id))
            .await?
            .ok_or_else(|| reject("orphaned"))?;

        counter!("auth_success_total").increment(1);
        debug!(user_id = user.id, "Resolved request identity");

        Ok(Identity::authenticated(user.id, user.activated, user.permissions))
    }

    async fn bounded<T, F>(&self, lookup: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.lookup_timeout, lookup).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(StoreError::Timeout(self.config.lookup_timeout).into()),
        }
    }
}

fn reject(reason: &'static str) -> AppError {
    counter!("auth_failures_total", "reason" => reason).increment(1);
    debug!(reason, "Rejected authentication credential");
    AppError::InvalidCredential
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Authentication layer for Tower.
#[derive(Clone)]
pub struct AuthLayer {
    resolver: Arc<IdentityResolver>,
}

impl AuthLayer {
    /// Create a new auth layer.
    pub fn new(resolver: Arc<IdentityResolver>) -> Self {
        Self { resolver }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            resolver: self.resolver.clone(),
        }
    }
}

/// Authentication service.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    resolver: Arc<IdentityResolver>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let resolver = self.resolver.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .cloned()
                .unwrap_or_else(RequestId::generate);

            let credential = bearer_credential(request.headers()).map(|c| c.map(str::to_owned));
            let resolved = match credential {
                Ok(credential) => resolver.resolve(credential.as_deref()).await,
                Err(e) => Err(e),
            };

            let mut response = match resolved {
                Ok(identity) => {
                    request
                        .extensions_mut()
                        .insert(RequestContext::new(request_id, identity));
                    inner.call(request).await?
                }
                Err(e) => e.into_response(),
            };

            response
                .headers_mut()
                .append(header::VARY, HeaderValue::from_static("Authorization"));
            Ok(response)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::error::ErrorCode;

    const TOKEN: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    fn resolver(store: Arc<MemoryStore>) -> IdentityResolver {
        IdentityResolver::new(store.clone(), store, AuthConfig::default())
    }

    #[test]
    fn test_token_shape() {
        assert!(is_well_formed(TOKEN));
        assert!(is_well_formed("234567ABCDEFGHIJKLMNOPQRST"));
        assert!(!is_well_formed("abcdefghijklmnopqrstuvwxyz"));
        assert!(!is_well_formed("ABCDEFGHIJKLMNOPQRSTUVWXY"));
        assert!(!is_well_formed("ABCDEFGHIJKLMNOPQRSTUVWXY1"));
    }

    #[test]
    fn test_bearer_credential_extraction() {
        let mut headers = HeaderMap::new();
        assert!(matches!(bearer_credential(&headers), Ok(None)));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_credential(&headers).unwrap(), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(matches!(bearer_credential(&headers), Err(AppError::InvalidCredential)));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(matches!(bearer_credential(&headers), Err(AppError::InvalidCredential)));
    }

    #[test]
    fn test_identity_snapshot() {
        let identity = Identity::authenticated(7, true, ["movies:read"]);
        assert!(!identity.is_anonymous());
        assert_eq!(identity.user_id(), Some(7));
        assert!(identity.has_permission("movies:read"));
        assert!(!identity.has_permission("movies:write"));

        let anonymous = Identity::anonymous();
        assert!(anonymous.is_anonymous());
        assert!(!anonymous.is_activated());
    }

    #[tokio::test]
    async fn test_missing_credential_is_anonymous() {
        let resolver = resolver(Arc::new(MemoryStore::new()));
        let identity = resolver.resolve(None).await.unwrap();
        assert!(identity.is_anonymous());
    }

    #[tokio::test]
    async fn test_valid_credential_resolves_user() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(42, true, ["movies:read", "movies:write"]);
        store.insert_token(TOKEN, 42, AUTHENTICATION_SCOPE, Utc::now() + chrono::Duration::hours(1));

        let identity = resolver(store).resolve(Some(TOKEN)).await.unwrap();
        assert_eq!(identity.user_id(), Some(42));
        assert!(identity.is_activated());
        assert!(identity.has_permission("movies:write"));
    }

    #[tokio::test]
    async fn test_expired_credential_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(42, true, ["movies:read"]);
        store.insert_token(TOKEN, 42, AUTHENTICATION_SCOPE, Utc::now() - chrono::Duration::seconds(1));

        let err = resolver(store).resolve(Some(TOKEN)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCredential);
    }

    #[tokio::test]
    async fn test_wrong_scope_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(42, true, Vec::<String>::new());
        store.insert_token(TOKEN, 42, "activation", Utc::now() + chrono::Duration::hours(1));

        let err = resolver(store).resolve(Some(TOKEN)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCredential);
    }

    #[tokio::test]
    async fn test_malformed_credential_skips_store() {
        let store = Arc::new(MemoryStore::new());
        let err = resolver(store.clone()).resolve(Some("not-a-token")).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::InvalidCredential);
        assert_eq!(store.lookups(), 0);
    }

    #[tokio::test]
    async fn test_resolution_does_not_mutate_store() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(1, false, Vec::<String>::new());
        let expiry = Utc::now() + chrono::Duration::hours(1);
        store.insert_token(TOKEN, 1, AUTHENTICATION_SCOPE, expiry);

        let resolver = resolver(store.clone());
        resolver.resolve(Some(TOKEN)).await.unwrap();
        resolver.resolve(Some(TOKEN)).await.unwrap();

        assert_eq!(store.token_count(), 1);
        let record = store
            .lookup(&hash_token(TOKEN), AUTHENTICATION_SCOPE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.expiry, expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_hits_deadline() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_secs(10)));
        store.insert_user(1, true, Vec::<String>::new());
        store.insert_token(TOKEN, 1, AUTHENTICATION_SCOPE, Utc::now() + chrono::Duration::hours(1));

        let resolver = IdentityResolver::new(
            store.clone(),
            store,
            AuthConfig {
                lookup_timeout: Duration::from_millis(100),
            },
        );

        let err = resolver.resolve(Some(TOKEN)).await.unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::Timeout(_))));
        assert_eq!(err.code(), ErrorCode::InternalError);
    }
}
