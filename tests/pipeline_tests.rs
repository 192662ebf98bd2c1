//! End-to-end tests over a real TCP listener.
//!
//! Each test binds an ephemeral port, serves the application with
//! `ConnectInfo` so client addresses come from the socket, and talks to it
//! with `reqwest`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use request_gate::config::{JwtSecret, PipelineStage};
use request_gate::{App, Config, build_app};

struct TestServer {
    base: String,
    app: App,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let shutdown = CancellationToken::new();
        let app = build_app(&config, &shutdown).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app.router.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
            .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            app,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(format!("{}{path}", self.base))
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.app.shutdown())
            .await
            .unwrap();
    }
}

fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_rate_limit_burst_refill_and_isolation() {
    let server = TestServer::start(Config {
        pipeline: vec![PipelineStage::RateLimit],
        rate_limit_rps: 5.0,
        rate_limit_burst: 10,
        ..Config::default()
    })
    .await;

    for expected_remaining in (0..10).rev() {
        let response = server.get("/").send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), Some("10"));
        assert_eq!(
            header(&response, "x-ratelimit-remaining"),
            Some(expected_remaining.to_string().as_str())
        );
    }

    for _ in 0..3 {
        let response = server.get("/").send().await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
        assert_eq!(header(&response, "retry-after"), Some("1"));
        assert_eq!(
            response.text().await.unwrap(),
            "Rate limit exceeded. Please retry later."
        );
    }

    // A forwarded public address is a different client with its own bucket
    let response = server
        .get("/")
        .header("x-forwarded-for", "8.8.4.4")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("9"));

    // Health probes bypass the pipeline
    let response = server.get("/health").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), r#"{"ok":true}"#);

    tokio::time::sleep(Duration::from_secs(1)).await;

    for _ in 0..5 {
        let response = server.get("/").send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = server.get("/").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    assert_eq!(server.app.rate_limiter().unwrap().tracked_clients(), 2);
    server.stop().await;
}

#[tokio::test]
async fn test_whoami_reports_socket_and_forwarded_addresses() {
    let server = TestServer::start(Config {
        pipeline: vec![],
        ..Config::default()
    })
    .await;

    let direct = server.get("/whoami").send().await.unwrap();
    assert_eq!(direct.text().await.unwrap(), r#"{"ip":"127.0.0.1"}"#);

    let forwarded = server
        .get("/whoami")
        .header("x-forwarded-for", "1.1.1.1, 10.0.0.5")
        .send()
        .await
        .unwrap();
    assert_eq!(forwarded.text().await.unwrap(), r#"{"ip":"1.1.1.1"}"#);

    let private_only = server
        .get("/whoami")
        .header("x-forwarded-for", "10.0.0.5, 192.168.0.1")
        .send()
        .await
        .unwrap();
    assert_eq!(private_only.text().await.unwrap(), r#"{"ip":"127.0.0.1"}"#);

    server.stop().await;
}

#[tokio::test]
async fn test_full_pipeline_composition() {
    let server = TestServer::start(Config {
        pipeline: vec![
            PipelineStage::Recovery,
            PipelineStage::AccessLog,
            PipelineStage::Metrics,
            PipelineStage::Cors,
            PipelineStage::RateLimit,
            PipelineStage::Cidr,
            PipelineStage::Jwt,
        ],
        cors_allowed_origins: vec!["https://app.example.com".to_string()],
        jwt_secret: Some(JwtSecret::new("integration-secret")),
        ..Config::default()
    })
    .await;

    // CORS rejects before the rate limiter spends a token
    let response = server
        .get("/")
        .header("origin", "https://evil.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(header(&response, "x-ratelimit-remaining"), None);

    let preflight = server
        .client
        .request(reqwest::Method::OPTIONS, format!("{}/", server.base))
        .header("origin", "https://app.example.com")
        .header("access-control-request-method", "GET")
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        header(&preflight, "access-control-allow-origin"),
        Some("https://app.example.com")
    );

    // Loopback passes CIDR protection, then JWT wants a bearer token
    let response = server
        .get("/")
        .header("origin", "https://app.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("9"));

    let response = server
        .get("/")
        .header("authorization", "Bearer not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // A forwarded public address is outside the allowed networks
    let response = server
        .get("/")
        .header("x-forwarded-for", "8.8.8.8")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.text().await.unwrap(), "endpoint is protected");

    server.stop().await;
}
