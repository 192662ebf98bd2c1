//! Middleware composition.
//!
//! Every policy in this crate is a regular Tower [`Layer`]. To put layers of
//! different types into one ordered, runtime-configured list they are erased
//! behind the [`Middleware`] trait, which maps a [`Handler`] to a new
//! [`Handler`]. The [`Pipeline`] folds that list around a terminal service.
//!
//! # Onion Order
//!
//! ```text
//! Pipeline::new().with(m1).with(m2).build(h)  ==  m1(m2(h))
//!
//!   m1 pre → m2 pre → h → m2 post → m1 post
//! ```
//!
//! Order is security relevant (recovery should be outermost so a panic in
//! any later stage is still caught) and is left entirely to the caller.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

/// Type-erased request handler passed between middlewares.
pub type Handler = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

/// A unit that wraps the next handler in the chain.
///
/// Implemented automatically for every [`Layer<Handler>`] whose service is
/// infallible, cloneable and thread-safe. Use [`middleware_fn`] for ad-hoc
/// closures.
pub trait Middleware: Send + Sync {
    /// Wrap `next`, returning the handler that runs this middleware's logic.
    fn handle(&self, next: Handler) -> Handler;
}

impl<L> Middleware for L
where
    L: Layer<Handler> + Send + Sync,
    L::Service: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    <L::Service as Service<Request<Body>>>::Future: Send + 'static,
{
    fn handle(&self, next: Handler) -> Handler {
        Handler::new(self.layer(next))
    }
}

/// Middleware built from a plain `Fn(Handler) -> Handler`.
#[derive(Clone)]
pub struct FnMiddleware<F> {
    f: F,
}

impl<F> Layer<Handler> for FnMiddleware<F>
where
    F: Fn(Handler) -> Handler,
{
    type Service = Handler;

    fn layer(&self, inner: Handler) -> Self::Service {
        (self.f)(inner)
    }
}

/// Create a middleware from a closure.
pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: Fn(Handler) -> Handler + Send + Sync,
{
    FnMiddleware { f }
}

/// Ordered list of middlewares, outermost first.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; it runs inside every middleware added before it.
    pub fn with<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Append an already shared middleware.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Number of middlewares in the pipeline.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Whether the pipeline has no middlewares.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Compose the pipeline around `terminal`.
    ///
    /// The first middleware added becomes the outermost wrapper.
    pub fn build<S>(&self, terminal: S) -> Handler
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.middlewares
            .iter()
            .rev()
            .fold(Handler::new(terminal), |next, middleware| {
                middleware.handle(next)
            })
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("len", &self.middlewares.len())
            .finish()
    }
}

/// Short-circuit response with a plain text body.
pub(crate) fn plain_response(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    (status, body.into()).into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use tower::{ServiceExt, service_fn};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(name: &'static str, log: Log) -> impl Middleware {
        middleware_fn(move |next: Handler| {
            let log = log.clone();
            Handler::new(service_fn(move |req: Request<Body>| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.lock().push(format!("{name} pre"));
                    let response = next.oneshot(req).await;
                    log.lock().push(format!("{name} post"));
                    response
                }
            }))
        })
    }

    fn terminal(log: Log) -> Handler {
        Handler::new(service_fn(move |_req: Request<Body>| {
            let log = log.clone();
            async move {
                log.lock().push("handler".to_string());
                Ok::<_, Infallible>(plain_response(StatusCode::OK, "ok"))
            }
        }))
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log: Log = Arc::default();
        let handler = Pipeline::new()
            .with(recording("m1", log.clone()))
            .with(recording("m2", log.clone()))
            .build(terminal(log.clone()));

        let response = handler
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *log.lock(),
            vec!["m1 pre", "m2 pre", "handler", "m2 post", "m1 post"]
        );
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_terminal() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::new();
        assert!(pipeline.is_empty());

        let response = pipeline
            .build(terminal(log.clone()))
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*log.lock(), vec!["handler"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner() {
        let log: Log = Arc::default();
        let deny = middleware_fn(|_next: Handler| {
            Handler::new(service_fn(|_req: Request<Body>| async {
                Ok::<_, Infallible>(plain_response(StatusCode::FORBIDDEN, "no"))
            }))
        });
        let handler = Pipeline::new()
            .with(recording("outer", log.clone()))
            .with(deny)
            .with(recording("inner", log.clone()))
            .build(terminal(log.clone()));

        let response = handler
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(*log.lock(), vec!["outer pre", "outer post"]);
    }

    #[test]
    fn test_push_shared_middleware() {
        let mut pipeline = Pipeline::new();
        let shared: Arc<dyn Middleware> = Arc::new(middleware_fn(|next: Handler| next));
        pipeline.push(shared.clone());
        pipeline.push(shared);
        assert_eq!(pipeline.len(), 2);
    }
}
