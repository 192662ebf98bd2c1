//! HTTP middleware for traffic shaping, access control and observability.
//!
//! Every policy is a Tower layer and, through the blanket impl in
//! [`pipeline`], a [`Middleware`] that can be placed in a runtime-ordered
//! [`Pipeline`]:
//!
//! - **Rate Limiting**: per-client continuous token bucket with idle eviction
//! - **CIDR Protection**: loopback plus an allow-list of networks
//! - **CORS**: origin allow-list and preflight handling
//! - **JWT**: HMAC-signed bearer tokens
//! - **Recovery**: handler panics become 500s
//! - **Access Log / Metrics**: per-request log line and Prometheus series
//!
//! # Architecture
//!
//! ```text
//! Request → Recovery → Access Log → Metrics → CORS → Rate Limiter → CIDR → JWT → Handler
//!              ↓                               ↓          ↓           ↓      ↓
//!             500                             403        429         401  400/401
//! ```
//!
//! The order above is the recommended one; the actual order is whatever
//! the pipeline was built with.
//!
//! # Security Considerations
//!
//! - Client addresses come from `X-Forwarded-For` / `X-Real-IP` when present
//!   (see [`ip`]); only deploy behind a proxy that overwrites these headers
//! - Rate limiting state is bounded by idle eviction
//! - Requests whose client address cannot be determined are refused

pub mod access_log;
pub mod bucket;
pub mod cidr;
pub mod cors;
pub mod ip;
pub mod jwt;
pub mod observe;
pub mod pipeline;
pub mod rate_limit;
pub mod recovery;
pub mod request_metrics;
pub mod store;

pub use access_log::AccessLogLayer;
pub use bucket::{RateLimitDecision, TokenBucket};
pub use cidr::{CidrProtectLayer, CidrRange, InvalidCidr};
pub use cors::CorsLayer;
pub use ip::{
    AddressResolutionError, ClientKey, RemoteAddr, X_FORWARDED_FOR, X_REAL_IP, parse_peer_addr,
    resolve_client_ip, resolve_client_key,
};
pub use jwt::{JwtAuthLayer, RegisteredClaims};
pub use pipeline::{Handler, Middleware, Pipeline, middleware_fn};
pub use rate_limit::{
    RateLimitConfig, RateLimitError, RateLimitLayer, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
};
pub use recovery::RecoveryLayer;
pub use request_metrics::RequestMetricsLayer;
pub use store::ClientStateStore;
