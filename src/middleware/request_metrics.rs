//! Per-request HTTP metrics.
//!
//! Records, labelled by `method`, `route` and `status`:
//! - request duration (histogram, seconds)
//! - request body bytes read by the inner service (counter)
//! - response body bytes written (counter)
//!
//! `route` is the pattern given to [`RequestMetricsLayer::for_route`], or the
//! raw request path when none was given. Prefer a pattern when paths carry
//! identifiers, since every distinct path becomes its own time series.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use tokio::time::Instant;
use tower::{Layer, Service};

use super::observe::{count_request_body, observe_response};
use crate::metrics;

/// Request metrics layer.
#[derive(Debug, Clone, Default)]
pub struct RequestMetricsLayer {
    route: Option<Arc<str>>,
}

impl RequestMetricsLayer {
    /// Label requests with their path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Label every request with `pattern` instead of its path.
    pub fn for_route(pattern: impl Into<Arc<str>>) -> Self {
        Self {
            route: Some(pattern.into()),
        }
    }
}

impl<S> Layer<S> for RequestMetricsLayer {
    type Service = RequestMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestMetricsService {
            inner,
            route: self.route.clone(),
        }
    }
}

/// Request metrics service wrapper.
#[derive(Clone)]
pub struct RequestMetricsService<S> {
    inner: S,
    route: Option<Arc<str>>,
}

impl<S> Service<Request<Body>> for RequestMetricsService<S>
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let start = Instant::now();
        let method = req.method().clone();
        let route = match &self.route {
            Some(pattern) => pattern.to_string(),
            None => req.uri().path().to_owned(),
        };
        let (req, request_bytes) = count_request_body(req);

        Box::pin(async move {
            let response = inner.call(req).await?;
            Ok(observe_response(response, move |summary| {
                metrics::record_request(
                    method.as_str(),
                    &route,
                    summary.status.as_u16(),
                    start.elapsed().as_secs_f64(),
                    request_bytes.load(Ordering::Relaxed),
                    summary.bytes,
                );
            }))
        })
    }
}
