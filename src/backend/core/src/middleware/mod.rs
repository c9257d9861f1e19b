//! Request pipeline middleware for Greenlight Core.
//!
//! Outermost to innermost: recovery, rate limiting, authentication. Capability
//! gates are attached per route.
pub mod rate_limit;
pub mod auth;
pub mod capability;
pub mod recovery;

pub use rate_limit::{BypassPredicate, ClientLimiter, RateLimitConfig, RateLimitDecision, RateLimitLayer};
pub use auth::{
    AuthConfig, AuthLayer, CredentialRecord, CredentialStore, Identity, IdentityResolver,
    RequestContext, StoreError, UserRecord, UserStore,
};
pub use capability::{Activated, Authenticated, CapabilityLayer, Requirement};
pub use recovery::{RecoveryLayer, RequestId};
