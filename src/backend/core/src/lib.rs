#![allow(clippy::result_large_err)]
//! # Greenlight Core
//!
//! Request lifecycle core of the Greenlight JSON API.
//!
//! ## Architecture
//!
//! - **Rate limiting**: Per-client token buckets with idle sweeping
//! - **Identity**: Bearer tokens resolved to immutable identity snapshots
//! - **Capabilities**: Authentication, activation and permission gates
//! - **Recovery**: Panics become 500 responses, never process crashes
//! - **Tasks**: Tracked background work that shutdown waits for
//! - **Shutdown**: Signal-driven drain with a shared grace deadline
//! - **Observability**: Structured logging, OTLP tracing and Prometheus metrics

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod shutdown;
pub mod tasks;
pub mod version;

pub use error::{AppError, ErrorCode, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::{build_router, AppState};
    pub use crate::config::{Config, Environment};
    pub use crate::error::{AppError, ErrorCode, Result};
    pub use crate::middleware::{
        Activated, AuthConfig, AuthLayer, Authenticated, CapabilityLayer, ClientLimiter,
        CredentialStore, Identity, IdentityResolver, RateLimitConfig, RateLimitLayer,
        RecoveryLayer, RequestContext, RequestId, Requirement, UserStore,
    };
    pub use crate::shutdown::{ShutdownConfig, ShutdownCoordinator, ShutdownOutcome};
    pub use crate::tasks::{Notifier, TaskTracker, TracingNotifier};
}
