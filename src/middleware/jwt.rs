//! JWT bearer authentication middleware.
//!
//! Requests must carry `Authorization: Bearer <token>` where the token is an
//! HMAC-signed (HS256/HS384/HS512) JWT for the configured secret.
//!
//! | Situation                                    | Status |
//! |----------------------------------------------|--------|
//! | No `Authorization` header                    | 401    |
//! | Header is not `Bearer <token>`               | 400    |
//! | Bad signature, expired, not yet valid        | 401    |
//! | Any other decoding error (not a JWT, ...)    | 400    |
//! | Valid token                                  | passed through unmodified |
//!
//! `exp` and `nbf` are checked when present, without leeway. No claim is
//! mandatory and the audience is not checked.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};
use tracing::debug;

use super::pipeline::plain_response;

/// Registered JWT claims, all optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisteredClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// String or array of strings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// Why a request was not authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthFailure {
    Missing,
    Malformed,
    Rejected(String),
    Invalid(String),
}

impl AuthFailure {
    fn status(&self) -> StatusCode {
        match self {
            Self::Missing | Self::Rejected(_) => StatusCode::UNAUTHORIZED,
            Self::Malformed | Self::Invalid(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let body = match self {
            Self::Missing => "authentication required".to_string(),
            Self::Malformed => "header authorization not containing a bearer token".to_string(),
            Self::Rejected(reason) | Self::Invalid(reason) => reason,
        };
        plain_response(status, body)
    }
}

/// Extract the token from a `Bearer <token>` authorization header.
fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthFailure> {
    let value = headers.get(AUTHORIZATION).ok_or(AuthFailure::Missing)?;
    let value = value.to_str().map_err(|_| AuthFailure::Malformed)?;
    if value.is_empty() {
        return Err(AuthFailure::Missing);
    }

    let (scheme, token) = value.split_once(' ').ok_or(AuthFailure::Malformed)?;
    if !scheme.eq_ignore_ascii_case("bearer")
        || token.is_empty()
        || token.chars().any(char::is_whitespace)
    {
        return Err(AuthFailure::Malformed);
    }
    Ok(token)
}

/// Verifier shared by every clone of the layer.
struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    fn verify(&self, token: &str) -> Result<RegisteredClaims, AuthFailure> {
        decode::<RegisteredClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::ExpiredSignature
                | ErrorKind::ImmatureSignature => AuthFailure::Rejected(e.to_string()),
                _ => AuthFailure::Invalid(e.to_string()),
            })
    }
}

/// JWT bearer authentication layer.
///
/// # Example
///
/// ```rust,ignore
/// let layer = JwtAuthLayer::new(b"my-secret");
/// ```
#[derive(Clone)]
pub struct JwtAuthLayer {
    verifier: Arc<JwtVerifier>,
}

impl JwtAuthLayer {
    /// Verify tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.required_spec_claims = HashSet::new();
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;

        Self {
            verifier: Arc::new(JwtVerifier {
                key: DecodingKey::from_secret(secret),
                validation,
            }),
        }
    }
}

impl fmt::Debug for JwtAuthLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuthLayer")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl<S> Layer<S> for JwtAuthLayer {
    type Service = JwtAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JwtAuthService {
            inner,
            verifier: self.verifier.clone(),
        }
    }
}

/// JWT authentication service wrapper.
#[derive(Clone)]
pub struct JwtAuthService<S> {
    inner: S,
    verifier: Arc<JwtVerifier>,
}

impl<S> Service<Request<Body>> for JwtAuthService<S>
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

        let verified = bearer_token(req.headers()).and_then(|token| self.verifier.verify(token));

        match verified {
            Ok(claims) => {
                debug!(sub = ?claims.sub, "JWT authentication successful");
                Box::pin(async move { inner.call(req).await })
            }
            Err(failure) => {
                debug!(
                    path = %req.uri().path(),
                    failure = ?failure,
                    "JWT authentication failed"
                );
                let response = failure.into_response();
                Box::pin(async move { Ok(response) })
            }
        }
    }
}
