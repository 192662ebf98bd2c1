//! Access logging middleware.
//!
//! Built on `tower_http`'s [`TraceLayer`]: each request gets an `access`
//! span carrying its method and path, and server errors are reported through
//! the layer's failure callback. Once the response body has been written (or
//! dropped) one `info` event is emitted inside that span:
//!
//! ```text
//! INFO request{method=GET path=/whoami}: access: Incoming request status=200 size=27 duration_ms=0.41
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use tokio::time::Instant;
use tower::{Layer, Service, ServiceBuilder};
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::{Level, Span, info, info_span};

use super::observe::observe_response;
use super::pipeline::Handler;

/// Access log layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLogLayer;

impl AccessLogLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for AccessLogLayer
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    type Service = Handler;

    fn layer(&self, inner: S) -> Self::Service {
        let trace = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<Body>| {
                info_span!(
                    target: "access",
                    "request",
                    method = %req.method(),
                    path = %req.uri().path(),
                )
            })
            .on_request(())
            .on_response(())
            .on_body_chunk(())
            .on_eos(())
            .on_failure(DefaultOnFailure::new().level(Level::WARN));

        Handler::new(
            ServiceBuilder::new()
                .map_response(|response: Response<_>| response.map(Body::new))
                .layer(trace)
                .service(LogOnCompletion { inner }),
        )
    }
}

/// Emits the access line when the response body completes.
#[derive(Clone)]
struct LogOnCompletion<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for LogOnCompletion<S>
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

        // Called inside the span entered by the trace layer.
        let span = Span::current();
        let start = Instant::now();

        Box::pin(async move {
            let response = inner.call(req).await?;
            Ok(observe_response(response, move |summary| {
                span.in_scope(|| {
                    info!(
                        target: "access",
                        status = summary.status.as_u16(),
                        size = summary.bytes,
                        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "Incoming request"
                    );
                });
            }))
        })
    }
}
