//! Per-client rate limiting middleware.
//!
//! Features:
//! - Token bucket per client key (normally the client IP)
//! - One map-wide lock shared by lookup, refill/consume and the idle sweep
//! - Periodic reclamation of idle clients so memory tracks active clients only
//! - Trusted-address and caller-supplied bypass predicates
//! - `Retry-After` on rejection
//!
//! # Example
//!
//! ```rust,ignore
//! use greenlight_core::middleware::rate_limit::{ClientLimiter, RateLimitConfig, RateLimitLayer};
//!
//! let limiter = Arc::new(ClientLimiter::new(
//!     RateLimitConfig::builder().requests_per_second(2.0).burst(4).build(),
//! ));
//! limiter.clone().spawn_sweeper(shutdown_token);
//!
//! let app = Router::new()
//!     .route("/v1/movies", get(list_movies))
//!     .layer(RateLimitLayer::new(limiter));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, info};

use crate::error::AppError;

/// Key used when neither the peer address nor a trusted proxy header is known.
const UNKNOWN_CLIENT: &str = "unknown";

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Token refill rate per client
    #[serde(alias = "rps")]
    pub requests_per_second: f64,

    /// Token bucket capacity
    pub burst: u32,

    /// Clients untouched for longer than this are reclaimed by the sweep
    #[serde(with = "humantime_serde")]
    pub idle_threshold: Duration,

    /// How often the background sweep runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Addresses exempt from rate limiting
    pub trusted_ips: Vec<IpAddr>,

    /// Prefer `X-Forwarded-For` / `X-Real-IP` over the peer address
    pub trust_proxy_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 2.0,
            burst: 4,
            idle_threshold: Duration::from_secs(3 * 60),
            sweep_interval: Duration::from_secs(60),
            trusted_ips: Vec::new(),
            trust_proxy_headers: false,
        }
    }
}

impl RateLimitConfig {
    /// Create a new builder for rate limit configuration.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }
}

/// Builder for rate limit configuration.
#[derive(Debug, Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn requests_per_second(mut self, rps: f64) -> Self {
        self.config.requests_per_second = rps;
        self
    }

    pub fn burst(mut self, burst: u32) -> Self {
        self.config.burst = burst;
        self
    }

    pub fn idle_threshold(mut self, threshold: Duration) -> Self {
        self.config.idle_threshold = threshold;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn trusted_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.config.trusted_ips = ips;
        self
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.config.trust_proxy_headers = trust;
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token Bucket Algorithm
// ═══════════════════════════════════════════════════════════════════════════════

/// Token bucket for a single client.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens, always within `0.0..=capacity`
    tokens: f64,

    /// Maximum tokens (burst capacity)
    capacity: f64,

    /// Token refill rate per second
    refill_rate: f64,

    /// Last refill time
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity: f64::from(capacity),
            refill_rate,
            last_refill: now,
        }
    }

    /// Refill, then take one token if available.
    fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one whole token is available.
    fn time_until_available(&self) -> Duration {
        let missing = 1.0 - self.tokens;
        if missing <= 0.0 || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            // Vanishingly small rates overflow `Duration`.
            Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX)
        }
    }
}

/// Bucket plus bookkeeping for reclamation.
#[derive(Debug)]
struct LimiterEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a single rate limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,

    /// Wait before a retry can succeed (zero when allowed)
    pub retry_after: Duration,
}

impl RateLimitDecision {
    const ALLOWED: Self = Self {
        allowed: true,
        retry_after: Duration::ZERO,
    };

    /// Whole seconds for the `Retry-After` header, never below one.
    pub fn retry_after_secs(&self) -> u64 {
        (self.retry_after.as_secs_f64().ceil() as u64).max(1)
    }
}

/// Process-local token-bucket limiter keyed by client.
///
/// The entry map is the only state mutated directly by concurrent requests.
/// It sits behind a single mutex; nothing outside this type touches it.
pub struct ClientLimiter {
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, LimiterEntry>>,
}

impl ClientLimiter {
    /// Create a new limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether the address is on the trusted list.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.config.trusted_ips.contains(ip)
    }

    /// Decide whether `key` may make a request now.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).allowed
    }

    /// Like [`allow`](Self::allow), also reporting how long to back off.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::ALLOWED;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();

        let entry = entries.entry(key.to_string()).or_insert_with(|| LimiterEntry {
            bucket: TokenBucket::new(self.config.burst, self.config.requests_per_second, now),
            last_seen: now,
        });
        entry.last_seen = now;

        if entry.bucket.try_acquire(now) {
            RateLimitDecision::ALLOWED
        } else {
            RateLimitDecision {
                allowed: false,
                retry_after: entry.bucket.time_until_available(),
            }
        }
    }

    /// Remove clients idle for longer than the configured threshold.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let threshold = self.config.idle_threshold;

        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= threshold);
        let remaining = entries.len();
        drop(entries);

        gauge!("rate_limiter_clients").set(remaining as f64);
        before - remaining
    }

    /// Number of clients currently tracked.
    pub fn client_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether a bucket exists for `key`.
    pub fn is_tracked(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `shutdown` fires.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                return;
            }

            let period = self.config.sweep_interval;
            let mut interval_timer = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Rate limiter sweeper stopped");
                        break;
                    }
                    _ = interval_timer.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, remaining = self.client_count(), "Reclaimed idle rate limit entries");
                        }
                    }
                }
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client Key Extraction
// ═══════════════════════════════════════════════════════════════════════════════

/// Extract the client IP from headers and connection info.
pub fn client_ip(
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> Option<IpAddr> {
    if trust_proxy_headers {
        for header_name in ["X-Forwarded-For", "X-Real-IP"] {
            if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
                // X-Forwarded-For can contain multiple IPs, the first is the client
                let candidate = value.split(',').next().unwrap_or(value).trim();
                if let Ok(ip) = candidate.parse() {
                    return Some(ip);
                }
            }
        }
    }

    remote_addr.map(|addr| addr.ip())
}

/// Predicate deciding whether a request skips the limiter entirely.
pub type BypassPredicate = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limiting layer for Tower.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<ClientLimiter>,
    bypass: Option<BypassPredicate>,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new(limiter: Arc<ClientLimiter>) -> Self {
        Self {
            limiter,
            bypass: None,
        }
    }

    /// Skip the limiter for requests matching `predicate`.
    pub fn with_bypass(mut self, predicate: Option<BypassPredicate>) -> Self {
        self.bypass = predicate;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            bypass: self.bypass.clone(),
        }
    }
}

/// Rate limiting service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<ClientLimiter>,
    bypass: Option<BypassPredicate>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let limiter = self.limiter.clone();
        let bypass = self.bypass.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !limiter.config.enabled || bypass.as_ref().is_some_and(|skip| skip(&request)) {
                return inner.call(request).await;
            }

            let remote_addr = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0);
            let ip = client_ip(request.headers(), remote_addr, limiter.config.trust_proxy_headers);

            if ip.is_some_and(|ip| limiter.is_trusted(&ip)) {
                return inner.call(request).await;
            }

            let key = ip.map_or_else(|| UNKNOWN_CLIENT.to_string(), |ip| ip.to_string());
            let decision = limiter.check(&key);
            if decision.allowed {
                return inner.call(request).await;
            }

            counter!("rate_limit_rejected_total").increment(1);
            info!(client = %key, path = %request.uri().path(), "Rate limit exceeded");

            Ok(AppError::RateLimitExceeded {
                retry_after_secs: decision.retry_after_secs(),
            }
            .into_response())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
