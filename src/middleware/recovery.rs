//! Panic recovery middleware.
//!
//! A panic raised by any inner layer or handler, either while building the
//! response future or while polling it, is caught and turned into an empty
//! `500 Internal Server Error`. The panic message is logged at `error` and
//! counted in [`names::PANICS_RECOVERED_TOTAL`](crate::metrics::names::PANICS_RECOVERED_TOTAL).
//!
//! Put this layer first in the pipeline so it wraps everything else.
//! Panics while streaming a response body are not covered: by then the
//! status line has already been produced.
//!
//! Requires `panic = "unwind"` (the default).

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use futures::FutureExt;
use tower::{Layer, Service};
use tracing::error;

use crate::metrics;

/// Panic recovery layer.
#[derive(Debug, Clone, Default)]
pub struct RecoveryLayer {
    recovered: Arc<AtomicU64>,
}

impl RecoveryLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of panics recovered by services built from this layer.
    pub fn recovered_count(&self) -> u64 {
        self.recovered.load(Ordering::Relaxed)
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            recovered: self.recovered.clone(),
        }
    }
}

/// Panic recovery service wrapper.
#[derive(Clone)]
pub struct RecoveryService<S> {
    inner: S,
    recovered: Arc<AtomicU64>,
}

impl<S> Service<Request<Body>> for RecoveryService<S>
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

        let recovered = self.recovered.clone();
        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
            Ok(future) => future,
            Err(payload) => {
                let response = recover(&recovered, &method, &path, payload.as_ref());
                return Box::pin(async move { Ok(response) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Ok(recover(&recovered, &method, &path, payload.as_ref())),
            }
        })
    }
}

fn recover(
    recovered: &AtomicU64,
    method: &Method,
    path: &str,
    payload: &(dyn Any + Send),
) -> Response<Body> {
    recovered.fetch_add(1, Ordering::Relaxed);
    metrics::record_panic_recovered();
    error!(
        method = %method,
        path,
        panic = panic_message(payload),
        "Recovering from a panic"
    );

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
