//! Per-client rate limiting middleware using a continuous token bucket.
//!
//! # Algorithm
//!
//! Every resolved client address gets its own [`TokenBucket`] holding up to
//! `burst` tokens that refill at `refill_per_second`. A request spends one
//! token; with less than one token left it is rejected.
//!
//! - Per-client isolation: one noisy client never drains another's bucket
//! - Fractional refill: slow rates (e.g. 0.5/s) are honoured exactly
//! - Bounded memory: a background janitor evicts idle clients
//!
//! # Response Headers
//!
//! On every decision:
//! - `X-RateLimit-Limit`: Configured burst capacity
//! - `X-RateLimit-Remaining`: Whole tokens left after this request
//!
//! On rate limit exceeded (429), additionally:
//! - `Retry-After`: Seconds until the next token is available
//!
//! A request whose client address cannot be resolved is answered with 500
//! and never reaches the inner service.
//!
//! # Lifecycle
//!
//! The janitor runs on a [`TaskTracker`] and stops when [`RateLimitLayer::shutdown`]
//! is awaited, when the parent cancellation token passed to
//! [`RateLimitLayer::with_cancellation`] fires, or when the last clone of the
//! layer is dropped.
//!
//! [`TokenBucket`]: super::bucket::TokenBucket

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use super::bucket::RateLimitDecision;
use super::ip::resolve_client_key;
use super::pipeline::plain_response;
use super::store::{ClientStateStore, run_janitor};
use crate::metrics;

/// Header carrying the configured burst capacity.
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";

/// Header carrying the whole tokens left after the request.
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Default janitor period.
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(60);

/// Default idle time after which a client's bucket is dropped.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(300);

/// Error type for rate limit layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RateLimitError {
    /// Refill rate is zero, negative, NaN or infinite.
    #[error("refill rate must be a finite number greater than 0, got {0}")]
    InvalidRate(f64),

    /// Burst capacity is zero.
    #[error("burst must be at least 1")]
    ZeroBurst,

    /// Janitor period is zero.
    #[error("clean interval must be greater than 0")]
    ZeroCleanInterval,

    /// Inactivity threshold is zero.
    #[error("inactivity threshold must be greater than 0")]
    ZeroInactivityThreshold,

    /// No Tokio runtime is available to run the janitor.
    #[error("rate limiter must be created inside a Tokio runtime")]
    NoRuntime,
}

/// Rate limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Tokens regained per second.
    pub refill_per_second: f64,
    /// Bucket capacity, i.e. requests admitted back to back after idling.
    pub burst: u32,
    /// How often idle clients are evicted.
    pub clean_interval: Duration,
    /// Silence after which a client's bucket is evicted.
    pub inactivity_threshold: Duration,
}

impl RateLimitConfig {
    /// Config with the given rate and burst and default janitor timings.
    pub fn new(refill_per_second: f64, burst: u32) -> Self {
        Self {
            refill_per_second,
            burst,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
            inactivity_threshold: DEFAULT_INACTIVITY_THRESHOLD,
        }
    }

    /// Override the janitor timings.
    pub fn with_janitor(mut self, clean_interval: Duration, inactivity_threshold: Duration) -> Self {
        self.clean_interval = clean_interval;
        self.inactivity_threshold = inactivity_threshold;
        self
    }

    /// Check that every parameter is strictly positive.
    ///
    /// # Errors
    ///
    /// Returns the first [`RateLimitError`] found.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if !self.refill_per_second.is_finite() || self.refill_per_second <= 0.0 {
            return Err(RateLimitError::InvalidRate(self.refill_per_second));
        }
        if self.burst == 0 {
            return Err(RateLimitError::ZeroBurst);
        }
        if self.clean_interval.is_zero() {
            return Err(RateLimitError::ZeroCleanInterval);
        }
        if self.inactivity_threshold.is_zero() {
            return Err(RateLimitError::ZeroInactivityThreshold);
        }
        Ok(())
    }
}

/// Janitor task handle; cancels the task when the last layer clone drops.
struct Janitor {
    cancel: CancellationToken,
    tracker: TaskTracker,
    _guard: DropGuard,
}

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RateLimitLayer::new(RateLimitConfig::new(5.0, 10))?; // 5/s, burst 10
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(layer);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    store: Arc<ClientStateStore>,
    limit: u32,
    janitor: Arc<Janitor>,
}

impl RateLimitLayer {
    /// Create a rate limit layer and start its janitor.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if the configuration is not strictly
    /// positive or no Tokio runtime is running.
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        Self::with_cancellation(config, &CancellationToken::new())
    }

    /// Create a rate limit layer whose janitor also stops when `parent` is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`RateLimitLayer::new`].
    pub fn with_cancellation(
        config: RateLimitConfig,
        parent: &CancellationToken,
    ) -> Result<Self, RateLimitError> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| RateLimitError::NoRuntime)?;

        let store = Arc::new(ClientStateStore::new(
            config.burst,
            config.refill_per_second,
        ));
        let cancel = parent.child_token();
        let tracker = TaskTracker::new();
        tracker.spawn_on(
            run_janitor(
                store.clone(),
                config.clean_interval,
                config.inactivity_threshold,
                cancel.clone(),
            ),
            &handle,
        );
        tracker.close();

        info!(
            refill_per_second = config.refill_per_second,
            burst = config.burst,
            clean_interval_secs = config.clean_interval.as_secs_f64(),
            inactivity_threshold_secs = config.inactivity_threshold.as_secs_f64(),
            "Rate limiter created"
        );

        Ok(Self {
            store,
            limit: config.burst,
            janitor: Arc::new(Janitor {
                _guard: cancel.clone().drop_guard(),
                cancel,
                tracker,
            }),
        })
    }

    /// Configured burst capacity.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.store.len()
    }

    /// Stop the janitor and wait for it to finish.
    pub async fn shutdown(&self) {
        self.janitor.cancel.cancel();
        self.janitor.tracker.wait().await;
        debug!("Rate limiter janitor stopped");
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            store: self.store.clone(),
            _janitor: self.janitor.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    store: Arc<ClientStateStore>,
    _janitor: Arc<Janitor>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let key = match resolve_client_key(&req) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, path = %req.uri().path(), "Cannot resolve client address for rate limiting");
                return Box::pin(async move {
                    Ok(plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
                });
            }
        };

        let decision = self.store.check(key, Instant::now());

        if !decision.allowed {
            debug!(
                client = %key,
                path = %req.uri().path(),
                retry_after_secs = decision.retry_after_secs(),
                "Rate limit exceeded for client"
            );
            metrics::record_rate_limit_rejection();

            let mut response = plain_response(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please retry later.",
            );
            apply_rate_limit_headers(response.headers_mut(), &decision);
            return Box::pin(async move { Ok(response) });
        }

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            apply_rate_limit_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

/// Write the rate limit headers for `decision`.
fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(decision.remaining_whole()),
    );
    if let Some(secs) = decision.retry_after_secs() {
        headers.insert(RETRY_AFTER, HeaderValue::from(secs));
    }
}
