//! Built-in API handlers.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::AppState;
use crate::middleware::capability::Authenticated;
use crate::version::BUILD_VERSION;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "available",
        "system_info": {
            "environment": state.environment,
            "version": BUILD_VERSION,
        }
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Identity
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
pub struct IdentityResponse {
    pub user_id: Option<i64>,
    pub activated: bool,
    pub permissions: Vec<String>,
}

/// Describe the caller. Requires authentication but not activation, so a
/// client can learn that its account still needs activating.
pub async fn current_identity(Authenticated(ctx): Authenticated) -> Json<IdentityResponse> {
    let identity = &ctx.identity;
    Json(IdentityResponse {
        user_id: identity.user_id(),
        activated: identity.is_activated(),
        permissions: identity.permissions().map(str::to_owned).collect(),
    })
}
