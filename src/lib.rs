//! # request_gate
//!
//! Composable HTTP request-gating middleware for Axum, featuring:
//!
//! - **Rate Limiting**: per-client continuous token bucket with burst
//!   capacity, `X-RateLimit-*` / `Retry-After` headers and idle eviction
//! - **Access Control**: CIDR allow-lists, CORS and HMAC JWT bearer tokens
//! - **Resilience**: panic recovery into 500 responses
//! - **Observability**: structured access logs and Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  /health (ungated)  │  Pipeline (ordered by PIPELINE)       │
//! │                     ├───────────────────────────────────────┤
//! │                     │  Gated handlers (/, /whoami)          │
//! ├─────────────────────┴───────────────────────────────────────┤
//! │  ClientStateStore (token buckets) ← janitor task            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use axum::Router;
//! use axum::routing::get;
//! use request_gate::middleware::{Pipeline, RateLimitConfig, RateLimitLayer, RecoveryLayer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let limiter = RateLimitLayer::new(
//!         RateLimitConfig::new(5.0, 10)
//!             .with_janitor(Duration::from_secs(60), Duration::from_secs(300)),
//!     )?;
//!
//!     let handler = Pipeline::new()
//!         .with(RecoveryLayer::new())
//!         .with(limiter)
//!         .build(Router::new().route("/", get(|| async { "ok" })));
//!
//!     let app: Router = Router::new().fallback_service(handler);
//!     // Serve `app` with `into_make_service_with_connect_info::<SocketAddr>()`...
//!     # let _ = app;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! PIPELINE=recovery,access_log,rate_limit RATE_LIMIT_RPS=5 RATE_LIMIT_BURST=10 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::{App, build_app, build_pipeline};
