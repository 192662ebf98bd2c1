//! Application routing with a runtime-ordered middleware pipeline.
//!
//! # Request Flow
//!
//! ```text
//! Request
//!    │
//!    ├── /health ──────────────────────────────► health_check (never gated)
//!    │
//!    ▼
//! ┌──────────────────────────────┐
//! │  Pipeline (PIPELINE order)   │ ← recovery, access_log, metrics,
//! │                              │   cors, rate_limit, cidr, jwt
//! └──────────────┬───────────────┘
//!                │
//!                ▼
//!      Gated routes (/, /whoami)
//! ```
//!
//! The pipeline is mounted as the outer router's fallback, so every path
//! except `/health` passes through it, including unknown ones.

use axum::Router;
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, PipelineStage};
use crate::error::{AppError, AppResult};
use crate::handlers;
use crate::middleware::{
    AccessLogLayer, CidrProtectLayer, CorsLayer, JwtAuthLayer, Pipeline, RateLimitLayer,
    RecoveryLayer, RequestMetricsLayer,
};

/// Router plus the background resources it owns.
#[derive(Clone)]
pub struct App {
    pub router: Router,
    rate_limiter: Option<RateLimitLayer>,
}

impl App {
    /// Rate limiter instance, if the `rate_limit` stage is enabled.
    pub fn rate_limiter(&self) -> Option<&RateLimitLayer> {
        self.rate_limiter.as_ref()
    }

    /// Stop background tasks (the rate limiter janitor) and wait for them.
    pub async fn shutdown(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.shutdown().await;
        }
    }
}

/// Build the middleware pipeline from configuration.
///
/// Stages are added in `config.pipeline` order, outermost first. The rate
/// limiter is returned alongside so its janitor can be stopped on shutdown.
///
/// # Errors
///
/// Returns an error if a stage cannot be constructed from the configuration
/// (invalid rate parameters or CIDR, or no Tokio runtime for the janitor).
pub fn build_pipeline(
    config: &Config,
    shutdown: &CancellationToken,
) -> AppResult<(Pipeline, Option<RateLimitLayer>)> {
    if config.stage_enabled(PipelineStage::Recovery)
        && config.pipeline.first() != Some(&PipelineStage::Recovery)
    {
        warn!("recovery is not the outermost stage; panics in earlier stages are not caught");
    }

    let mut pipeline = Pipeline::new();
    let mut rate_limiter = None;

    for stage in &config.pipeline {
        pipeline = match stage {
            PipelineStage::Recovery => pipeline.with(RecoveryLayer::new()),
            PipelineStage::AccessLog => pipeline.with(AccessLogLayer::new()),
            PipelineStage::Metrics => pipeline.with(RequestMetricsLayer::new()),
            PipelineStage::Cors => {
                let cors = CorsLayer::new(&config.cors_allowed_origins);
                if cors.allows_any_origin() {
                    warn!("CORS allows any origin");
                }
                pipeline.with(cors)
            }
            PipelineStage::RateLimit => {
                let limiter =
                    RateLimitLayer::with_cancellation(config.rate_limit_config(), shutdown)?;
                rate_limiter = Some(limiter.clone());
                pipeline.with(limiter)
            }
            PipelineStage::Cidr => {
                pipeline.with(CidrProtectLayer::new(&config.allowed_cidrs)?)
            }
            PipelineStage::Jwt => match &config.jwt_secret {
                Some(secret) => pipeline.with(JwtAuthLayer::new(secret.as_bytes())),
                None => {
                    return Err(AppError::ConfigError(
                        "jwt stage requires JWT_SECRET".to_string(),
                    ));
                }
            },
        };
    }

    info!(
        stages = %config
            .pipeline
            .iter()
            .map(PipelineStage::as_str)
            .collect::<Vec<_>>()
            .join(" → "),
        "Middleware pipeline configured"
    );

    Ok((pipeline, rate_limiter))
}

/// Build the application router with the configured pipeline.
///
/// # Errors
///
/// Same as [`build_pipeline`].
pub fn build_app(config: &Config, shutdown: &CancellationToken) -> AppResult<App> {
    let (pipeline, rate_limiter) = build_pipeline(config, shutdown)?;

    let gated = Router::new()
        .route("/", get(handlers::index))
        .route("/whoami", get(handlers::whoami));

    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .fallback_service(pipeline.build(gated));

    Ok(App {
        router,
        rate_limiter,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::JwtSecret;
    use crate::middleware::RemoteAddr;

    fn config(pipeline: Vec<PipelineStage>) -> Config {
        Config {
            pipeline,
            rate_limit_rps: 1.0,
            rate_limit_burst: 2,
            ..Config::default()
        }
    }

    async fn status(app: &App, uri: &str, peer: &str) -> StatusCode {
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        req.extensions_mut().insert(RemoteAddr(peer.to_string()));
        app.router.clone().oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_empty_pipeline_serves_routes() {
        let app = build_app(&config(vec![]), &CancellationToken::new()).unwrap();

        assert!(app.rate_limiter().is_none());
        assert_eq!(status(&app, "/", "1.2.3.4:1").await, StatusCode::OK);
        assert_eq!(status(&app, "/whoami", "1.2.3.4:1").await, StatusCode::OK);
        assert_eq!(status(&app, "/missing", "1.2.3.4:1").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_is_not_rate_limited() {
        let app = build_app(
            &config(vec![PipelineStage::RateLimit]),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(status(&app, "/", "1.2.3.4:1").await, StatusCode::OK);
        assert_eq!(status(&app, "/", "1.2.3.4:1").await, StatusCode::OK);
        assert_eq!(
            status(&app, "/", "1.2.3.4:1").await,
            StatusCode::TOO_MANY_REQUESTS
        );
        for _ in 0..5 {
            assert_eq!(status(&app, "/health", "1.2.3.4:1").await, StatusCode::OK);
        }
        assert_eq!(app.rate_limiter().unwrap().tracked_clients(), 1);

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_paths_are_gated() {
        let app = build_app(
            &config(vec![PipelineStage::RateLimit]),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(status(&app, "/nope", "1.2.3.4:1").await, StatusCode::NOT_FOUND);
        assert_eq!(status(&app, "/nope", "1.2.3.4:1").await, StatusCode::NOT_FOUND);
        assert_eq!(
            status(&app, "/nope", "1.2.3.4:1").await,
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_cidr_stage_admits_loopback_and_allowed_networks() {
        let config = Config {
            allowed_cidrs: vec!["10.0.0.0/8".to_string()],
            ..config(vec![PipelineStage::Cidr])
        };
        let app = build_app(&config, &CancellationToken::new()).unwrap();

        assert_eq!(status(&app, "/", "127.0.0.1:1").await, StatusCode::OK);
        assert_eq!(status(&app, "/", "10.1.2.3:1").await, StatusCode::OK);
        assert_eq!(status(&app, "/", "192.168.1.1:1").await, StatusCode::UNAUTHORIZED);
        assert_eq!(status(&app, "/health", "192.168.1.1:1").await, StatusCode::OK);
    }

    #[test]
    fn test_cidr_stage_logs_once() {
        #[derive(Clone, Default)]
        struct Captured(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

        impl std::io::Write for Captured {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let config = Config {
            allowed_cidrs: vec!["10.0.0.0/8".to_string()],
            ..config(vec![PipelineStage::Cidr])
        };
        tracing::subscriber::with_default(subscriber, || {
            build_pipeline(&config, &CancellationToken::new()).unwrap();
        });

        let logs = String::from_utf8_lossy(&captured.0.lock()).into_owned();
        assert_eq!(logs.matches("CIDR protection enabled").count(), 1, "{logs}");
        assert!(logs.contains("10.0.0.0/8"), "{logs}");
    }

    #[tokio::test]
    async fn test_jwt_stage_requires_token() {
        let config = Config {
            jwt_secret: Some(JwtSecret::new("secret")),
            ..config(vec![PipelineStage::Recovery, PipelineStage::Jwt])
        };
        let app = build_app(&config, &CancellationToken::new()).unwrap();

        assert_eq!(status(&app, "/", "1.2.3.4:1").await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_jwt_stage_without_secret_fails() {
        let result = build_app(&config(vec![PipelineStage::Jwt]), &CancellationToken::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_janitor() {
        let token = CancellationToken::new();
        let app = build_app(&config(vec![PipelineStage::RateLimit]), &token).unwrap();

        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), app.shutdown())
            .await
            .unwrap();
    }
}
