//! API layer for Greenlight Core.
//!
//! [`build_router`] wraps caller-supplied business routes in the request
//! pipeline. Stages run outermost first:
//!
//! 1. panic recovery (also assigns the request id)
//! 2. access tracing, CORS, request deadline
//! 3. per-client rate limiting
//! 4. identity resolution
//! 5. capability gates, attached per route by the caller
//! 6. the handler
//!
//! # Example
//!
//! ```rust,ignore
//! let routes = Router::new()
//!     .route("/v1/movies", post(create_movie))
//!     .route_layer(CapabilityLayer::require_permission("movies:write"));
//!
//! let app = api::build_router(state, routes);
//! ```

mod handlers;

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{sync::Arc, time::Duration};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;

use crate::config::{CorsConfig, Environment};
use crate::middleware::{
    auth::{AuthLayer, IdentityResolver},
    rate_limit::{BypassPredicate, ClientLimiter, RateLimitLayer},
    recovery::{RecoveryLayer, RequestId},
};
use crate::tasks::{Notifier, TaskTracker};

pub use handlers::IdentityResponse;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<ClientLimiter>,
    pub resolver: Arc<IdentityResolver>,
    pub tasks: TaskTracker,
    pub notifier: Arc<dyn Notifier>,
    pub environment: Environment,
    pub request_timeout: Duration,
    pub cors: CorsConfig,
    pub metrics: Option<PrometheusHandle>,
    /// Requests matching this predicate skip the rate limiter.
    pub limiter_bypass: Option<BypassPredicate>,
}

impl AppState {
    /// Send a notification in the background.
    ///
    /// The request does not wait for delivery; shutdown does.
    pub fn notify(&self, recipient: impl Into<String>, template: &'static str, data: serde_json::Value) {
        let notifier = self.notifier.clone();
        let recipient = recipient.into();
        self.tasks.run(template, async move {
            notifier.send(&recipient, template, &data).await
        });
    }
}

/// Routes that only need the pipeline itself.
pub fn identity_routes() -> Router<AppState> {
    Router::new().route("/v1/identity", get(handlers::current_identity))
}

/// Build the API router around `routes`.
pub fn build_router(state: AppState, routes: Router<AppState>) -> Router {
    let cors = cors_layer(&state.cors);

    Router::new()
        .route("/v1/healthcheck", get(handlers::healthcheck))
        .route("/debug/metrics", get(handlers::prometheus_metrics))
        .merge(routes)
        // Layers run bottom-up: the last one added sees the request first.
        .layer(AuthLayer::new(state.resolver.clone()))
        .layer(RateLimitLayer::new(state.limiter.clone()).with_bypass(state.limiter_bypass.clone()))
        .layer(TimeoutLayer::new(state.request_timeout))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .map(ToString::to_string)
                .unwrap_or_default();
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        }))
        .layer(RecoveryLayer::new())
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .trusted_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}
