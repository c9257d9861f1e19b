//! Capability gates for individual routes.
//!
//! A gate reads the [`RequestContext`] injected by the auth middleware and
//! checks it against a [`Requirement`]. Checks run in a fixed order so the
//! client always learns the most basic missing capability first:
//!
//! 1. anonymous caller → `AUTHENTICATION_REQUIRED` (401)
//! 2. account not activated → `ACCOUNT_NOT_ACTIVATED` (403)
//! 3. permission code absent → `PERMISSION_DENIED` (403)
//!
//! A request that arrives without a context is treated as anonymous.
//!
//! # Example
//!
//! ```rust,ignore
//! use greenlight_core::middleware::capability::CapabilityLayer;
//!
//! let app = Router::new()
//!     .route("/v1/movies", get(list_movies))
//!     .route_layer(CapabilityLayer::require_permission("movies:read"));
//! ```

use axum::{
    body::Body,
    extract::{FromRequestParts, Request},
    http::request::Parts,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    fmt,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::debug;

use super::auth::{Identity, RequestContext};
use crate::error::AppError;

// ═══════════════════════════════════════════════════════════════════════════════
// Requirement
// ═══════════════════════════════════════════════════════════════════════════════

/// What a route demands of the caller. Each level implies the ones before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Authenticated,
    Activated,
    Permission(String),
}

impl Requirement {
    /// Check an identity against this requirement.
    pub fn check(&self, identity: &Identity) -> Result<(), AppError> {
        if identity.is_anonymous() {
            return Err(AppError::AuthenticationRequired);
        }
        if matches!(self, Self::Authenticated) {
            return Ok(());
        }

        if !identity.is_activated() {
            return Err(AppError::AccountNotActivated);
        }

        match self {
            Self::Permission(code) if !identity.has_permission(code) => {
                Err(AppError::PermissionDenied(code.clone()))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated => f.write_str("authenticated"),
            Self::Activated => f.write_str("activated"),
            Self::Permission(code) => write!(f, "permission {}", code),
        }
    }
}

fn check_parts(parts: &Parts, requirement: &Requirement) -> Result<RequestContext, AppError> {
    let ctx = parts.extensions.get::<RequestContext>().cloned();
    let anonymous = Identity::anonymous();
    let identity = ctx.as_ref().map_or(&anonymous, |c| c.identity.as_ref());

    requirement.check(identity).map_err(|e| {
        debug!(
            requirement = %requirement,
            user_id = ?identity.user_id(),
            code = %e.code(),
            "Capability check failed"
        );
        e
    })?;

    // check() succeeded, so the identity was not anonymous and a context exists
    ctx.ok_or(AppError::AuthenticationRequired)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer
// ═══════════════════════════════════════════════════════════════════════════════

/// Layer that wraps a route with a capability gate.
///
/// Intended for `Router::route_layer`, so unmatched paths still 404.
#[derive(Clone)]
pub struct CapabilityLayer {
    requirement: Arc<Requirement>,
}

impl CapabilityLayer {
    pub fn new(requirement: Requirement) -> Self {
        Self {
            requirement: Arc::new(requirement),
        }
    }

    pub fn require_authenticated() -> Self {
        Self::new(Requirement::Authenticated)
    }

    pub fn require_activated() -> Self {
        Self::new(Requirement::Activated)
    }

    /// Require the given permission code (e.g. `"movies:write"`).
    pub fn require_permission(code: impl Into<String>) -> Self {
        Self::new(Requirement::Permission(code.into()))
    }

    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }
}

impl<S> Layer<S> for CapabilityLayer {
    type Service = CapabilityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CapabilityService {
            inner,
            requirement: self.requirement.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Service that enforces a [`Requirement`] per request.
#[derive(Clone)]
pub struct CapabilityService<S> {
    inner: S,
    requirement: Arc<Requirement>,
}

impl<S> Service<Request<Body>> for CapabilityService<S>
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

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let requirement = self.requirement.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (parts, body) = request.into_parts();
            if let Err(e) = check_parts(&parts, &requirement) {
                return Ok(e.into_response());
            }
            inner.call(Request::from_parts(parts, body)).await
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Extractors
// ═══════════════════════════════════════════════════════════════════════════════

/// Extractor that only succeeds for authenticated callers.
#[derive(Debug, Clone)]
pub struct Authenticated(pub RequestContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        check_parts(parts, &Requirement::Authenticated).map(Self)
    }
}

/// Extractor that only succeeds for authenticated, activated callers.
#[derive(Debug, Clone)]
pub struct Activated(pub RequestContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Activated
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        check_parts(parts, &Requirement::Activated).map(Self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
