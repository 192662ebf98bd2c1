//! Built-in endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness probe, served outside the middleware pipeline
//! - `GET /` - Greeting, served through the pipeline
//! - `GET /whoami` - Echoes the client address the middleware sees

use axum::Json;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use crate::middleware::resolve_client_ip;

/// Health check response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
}

/// Client address response body.
#[derive(Debug, Serialize)]
pub struct WhoAmIResponse {
    pub ip: String,
}

/// Health check endpoint.
///
/// Always returns 200 OK with `{"ok":true}`. It is not gated, so probes keep
/// working while clients are throttled or blocked.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

pub async fn index() -> &'static str {
    "Hello from request_gate\n"
}

/// Report the resolved client address.
pub async fn whoami(req: Request<Body>) -> Response {
    match resolve_client_ip(&req) {
        Ok(ip) => Json(WhoAmIResponse { ip: ip.to_string() }).into_response(),
        Err(e) => {
            warn!(error = %e, "Cannot resolve client address");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    use crate::middleware::RemoteAddr;

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_body() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_whoami_prefers_forwarded_address() {
        let mut req = Request::builder()
            .header("x-forwarded-for", "8.8.8.8, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(RemoteAddr("10.0.0.2:4000".to_string()));

        let response = whoami(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"ip":"8.8.8.8"}"#);
    }

    #[tokio::test]
    async fn test_whoami_without_peer_is_server_error() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(whoami(req).await.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
