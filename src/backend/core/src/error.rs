//! Error handling for the Greenlight request lifecycle.
//!
//! Every recoverable failure detected by a pipeline stage is an [`AppError`]
//! that renders itself into the shared JSON error envelope:
//!
//! ```json
//! { "success": false, "error": { "code": "PERMISSION_DENIED", "message": "..." } }
//! ```
//!
//! Internal detail (store failures, panic payloads) is logged but never sent
//! to the client.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::middleware::auth::StoreError;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Greenlight operations.
pub type Result<T> = std::result::Result<T, AppError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable; clients use them to tell "log in" apart from
/// "verify your account" apart from "not permitted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimitExceeded,
    InvalidCredential,
    AuthenticationRequired,
    AccountNotActivated,
    PermissionDenied,
    InternalError,
    ShutdownTimeout,
}

impl ErrorCode {
    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidCredential | Self::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            Self::AccountNotActivated | Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::InternalError | Self::ShutdownTimeout => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire representation used in the JSON envelope.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InvalidCredential => "INVALID_CREDENTIAL",
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::AccountNotActivated => "ACCOUNT_NOT_ACTIVATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ShutdownTimeout => "SHUTDOWN_TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Greenlight Core.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("invalid or missing authentication token")]
    InvalidCredential,

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("user account not activated")]
    AccountNotActivated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unexpected failure: {0}")]
    UnexpectedFailure(String),

    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutdown did not complete within the {grace:?} grace period")]
    ShutdownTimeout { grace: Duration },
}

impl AppError {
    /// Create an unexpected-failure error from anything displayable.
    pub fn unexpected(message: impl fmt::Display) -> Self {
        Self::UnexpectedFailure(message.to_string())
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            Self::InvalidCredential => ErrorCode::InvalidCredential,
            Self::AuthenticationRequired => ErrorCode::AuthenticationRequired,
            Self::AccountNotActivated => ErrorCode::AccountNotActivated,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::UnexpectedFailure(_) | Self::Store(_) | Self::Database(_) | Self::Io(_) => {
                ErrorCode::InternalError
            }
            Self::ShutdownTimeout { .. } => ErrorCode::ShutdownTimeout,
        }
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code().http_status()
    }

    /// User-facing message. Safe to expose; never carries internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate limit exceeded, please slow down",
            Self::InvalidCredential => "invalid or missing authentication token",
            Self::AuthenticationRequired => "you must be authenticated to access this resource",
            Self::AccountNotActivated => "your user account must be activated to access this resource",
            Self::PermissionDenied(_) => {
                "your user account doesn't have the necessary permissions to access this resource"
            }
            _ => "the server encountered a problem and could not process your request",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.http_status().is_server_error() {
            error!(code = %self.code(), error = %self, "request failed");
        } else {
            warn!(code = %self.code(), error = %self, "request rejected");
        }
        self.render()
    }
}

impl AppError {
    /// Build the error envelope without logging. For callers that already
    /// logged the failure with more context.
    pub(crate) fn render(self) -> Response {
        let status = self.http_status();
        let code = self.code();

        counter!("http_errors_total", "code" => code.as_str()).increment(1);

        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": code,
                "message": self.user_message(),
            }
        });

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        match self {
            Self::RateLimitExceeded { retry_after_secs } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            }
            Self::InvalidCredential => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }
        response
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
