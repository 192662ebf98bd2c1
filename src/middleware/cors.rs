//! Cross-origin resource sharing policy.
//!
//! Response headers and preflight answers come from
//! [`tower_http::cors::CorsLayer`]. This module adds the refusals it does not
//! make on its own:
//!
//! - Origin not allowed: `403 Forbidden`, the inner service is not called.
//! - Preflight (`OPTIONS` with `Access-Control-Request-Method`) asking for a
//!   method or header outside the allow-lists: `403`. Accepted preflights
//!   are answered with `204`.
//! - Plain `OPTIONS` requests reach the inner service instead of being
//!   treated as preflights.
//!
//! Requests without an `Origin` header are not CORS requests and pass
//! through. An empty origin list, or one containing `*`, allows every origin
//! and answers with the wildcard. Origins are compared ASCII
//! case-insensitively.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{
    ACCEPT, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS,
    ACCESS_CONTROL_REQUEST_METHOD, AUTHORIZATION, CONTENT_TYPE, ORIGIN, VARY,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use tower::{Layer, Service, ServiceExt};
use tower_http::cors::{self, AllowOrigin, Cors};
use tracing::debug;

use super::pipeline::plain_response;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AllowedOrigins {
    Any,
    /// Lowercased origins.
    List(Vec<String>),
}

impl AllowedOrigins {
    fn allows(&self, origin: &HeaderValue) -> bool {
        match self {
            Self::Any => true,
            Self::List(list) => origin
                .to_str()
                .is_ok_and(|o| list.iter().any(|allowed| allowed.eq_ignore_ascii_case(o))),
        }
    }
}

/// What a request must satisfy before `tower-http` sees it.
#[derive(Debug, Clone)]
struct OriginGate {
    origins: Arc<AllowedOrigins>,
    methods: Vec<Method>,
    headers: Vec<HeaderName>,
}

impl OriginGate {
    fn preflight_allowed(&self, origin: &HeaderValue, req_headers: &HeaderMap) -> bool {
        let method = req_headers
            .get(ACCESS_CONTROL_REQUEST_METHOD)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let method_allowed = method.eq_ignore_ascii_case(Method::OPTIONS.as_str())
            || self
                .methods
                .iter()
                .any(|m| m.as_str().eq_ignore_ascii_case(method));

        let headers_allowed = req_headers
            .get_all(ACCESS_CONTROL_REQUEST_HEADERS)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .all(|h| self.headers.iter().any(|a| a.as_str().eq_ignore_ascii_case(h)));

        self.origins.allows(origin) && method_allowed && headers_allowed
    }

    fn allow_origin_value(&self, origin: &HeaderValue) -> HeaderValue {
        match *self.origins {
            AllowedOrigins::Any => HeaderValue::from_static("*"),
            AllowedOrigins::List(_) => origin.clone(),
        }
    }
}

/// CORS layer.
///
/// # Example
///
/// ```rust,ignore
/// let layer = CorsLayer::new(["https://app.example.com"])
///     .allow_methods([Method::GET, Method::POST, Method::PUT])
///     .max_age(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone)]
pub struct CorsLayer {
    gate: OriginGate,
    cors: cors::CorsLayer,
}

impl CorsLayer {
    /// Allow the given origins with the default methods and headers.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list: Vec<String> = origins
            .into_iter()
            .map(|o| o.as_ref().trim().to_ascii_lowercase())
            .filter(|o| !o.is_empty())
            .collect();

        let origins = if list.is_empty() || list.iter().any(|o| o == "*") {
            Arc::new(AllowedOrigins::Any)
        } else {
            Arc::new(AllowedOrigins::List(list))
        };

        let allow_origin = match *origins {
            AllowedOrigins::Any => AllowOrigin::any(),
            AllowedOrigins::List(_) => {
                let origins = origins.clone();
                AllowOrigin::predicate(move |origin, _| origins.allows(origin))
            }
        };

        let methods = vec![Method::GET, Method::POST, Method::HEAD];
        let headers = vec![
            ACCEPT,
            CONTENT_TYPE,
            ORIGIN,
            HeaderName::from_static("x-requested-with"),
            AUTHORIZATION,
        ];

        Self {
            cors: cors::CorsLayer::new()
                .allow_origin(allow_origin)
                .allow_methods(methods.clone())
                .allow_headers(headers.clone()),
            gate: OriginGate {
                origins,
                methods,
                headers,
            },
        }
    }

    /// Allow every origin.
    pub fn permissive() -> Self {
        Self::new(["*"])
    }

    /// Replace the methods allowed in preflight responses.
    pub fn allow_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.gate.methods = methods.into_iter().collect();
        self.cors = self.cors.allow_methods(self.gate.methods.clone());
        self
    }

    /// Replace the request headers allowed in preflight responses.
    pub fn allow_headers(mut self, headers: impl IntoIterator<Item = HeaderName>) -> Self {
        self.gate.headers = headers.into_iter().collect();
        self.cors = self.cors.allow_headers(self.gate.headers.clone());
        self
    }

    /// Let browsers cache preflight responses.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.cors = self.cors.max_age(max_age);
        self
    }

    /// Whether every origin is allowed.
    pub fn allows_any_origin(&self) -> bool {
        *self.gate.origins == AllowedOrigins::Any
    }
}

impl<S: Clone> Layer<S> for CorsLayer {
    type Service = CorsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorsService {
            cors: self.cors.layer(inner.clone()),
            inner,
            gate: self.gate.clone(),
        }
    }
}

/// CORS service wrapper.
#[derive(Clone)]
pub struct CorsService<S> {
    cors: Cors<S>,
    /// Same service without `tower-http` in front, for plain `OPTIONS`.
    inner: S,
    gate: OriginGate,
}

fn forbidden(reason: &'static str) -> Response<Body> {
    let mut response = plain_response(StatusCode::FORBIDDEN, reason);
    response
        .headers_mut()
        .append(VARY, HeaderValue::from_static("origin"));
    response
}

impl<S> Service<Request<Body>> for CorsService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.cors.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let origin = req.headers().get(ORIGIN).cloned();
        let is_options = req.method() == Method::OPTIONS;
        let is_preflight = is_options
            && origin.is_some()
            && req.headers().contains_key(ACCESS_CONTROL_REQUEST_METHOD);

        if let Some(origin) = &origin {
            if is_preflight && !self.gate.preflight_allowed(origin, req.headers()) {
                debug!(origin = ?origin, "CORS preflight rejected");
                return Box::pin(async { Ok(forbidden("CORS preflight rejected")) });
            }
            if !self.gate.origins.allows(origin) {
                debug!(origin = ?origin, path = %req.uri().path(), "CORS origin not allowed");
                return Box::pin(async { Ok(forbidden("origin not allowed")) });
            }
        }

        // tower-http answers every OPTIONS request itself
        if is_options && !is_preflight {
            let allow_origin = origin.map(|o| self.gate.allow_origin_value(&o));
            let inner = self.inner.clone();
            return Box::pin(async move {
                let mut response = inner.oneshot(req).await?;
                let headers = response.headers_mut();
                if let Some(allow_origin) = allow_origin {
                    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
                }
                headers.append(VARY, HeaderValue::from_static("origin"));
                Ok(response)
            });
        }

        let clone = self.cors.clone();
        let mut cors = std::mem::replace(&mut self.cors, clone);

        Box::pin(async move {
            let mut response = cors.call(req).await?;
            if is_preflight {
                *response.status_mut() = StatusCode::NO_CONTENT;
            }
            Ok(response)
        })
    }
}
