//! Prometheus metrics for application observability.
//!
//! Metrics are recorded through the [`metrics`] facade and exposed by a
//! dedicated Prometheus HTTP listener (default: `0.0.0.0:9090/metrics`).
//! Recording functions are cheap no-ops until a recorder is installed.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gate_http_request_body_bytes_total` - Request body bytes read (labels: method, route, status)
//! - `gate_http_response_body_bytes_total` - Response body bytes written (labels: method, route, status)
//! - `gate_panics_recovered_total` - Panics caught by the recovery middleware
//! - `gate_rate_limit_rejections_total` - Requests answered with 429
//! - `gate_rate_limit_evictions_total` - Idle clients dropped by the janitor
//!
//! ## Histograms
//! - `gate_http_request_duration_seconds` - Request duration (labels: method, route, status)
//!
//! ## Gauges
//! - `gate_rate_limit_tracked_clients` - Clients with a live token bucket
//!
//! # Usage
//!
//! ```rust,ignore
//! use request_gate::metrics::{init_metrics, record_panic_recovered};
//!
//! // Initialize metrics (call once at startup)
//! init_metrics("0.0.0.0:9090".parse()?)?;
//!
//! record_panic_recovered();
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

use crate::error::{AppError, AppResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUEST_DURATION_SECONDS: &str = "gate_http_request_duration_seconds";
    pub const REQUEST_BODY_BYTES_TOTAL: &str = "gate_http_request_body_bytes_total";
    pub const RESPONSE_BODY_BYTES_TOTAL: &str = "gate_http_response_body_bytes_total";
    pub const PANICS_RECOVERED_TOTAL: &str = "gate_panics_recovered_total";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "gate_rate_limit_rejections_total";
    pub const RATE_LIMIT_EVICTIONS_TOTAL: &str = "gate_rate_limit_evictions_total";
    pub const RATE_LIMIT_TRACKED_CLIENTS: &str = "gate_rate_limit_tracked_clients";
}

/// Initialize the Prometheus metrics exporter.
///
/// Installs the global recorder, starts the HTTP listener on `metrics_addr`
/// and describes every metric.
///
/// # Errors
///
/// Returns `AppError::Metrics` if the listener cannot bind or a recorder is
/// already installed.
pub fn init_metrics(metrics_addr: SocketAddr) -> AppResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| AppError::Metrics(format!("Failed to install Prometheus exporter: {e}")))?;

    describe_counter!(
        names::REQUEST_BODY_BYTES_TOTAL,
        "Total request body bytes read by handlers"
    );
    describe_counter!(
        names::RESPONSE_BODY_BYTES_TOTAL,
        "Total response body bytes written"
    );
    describe_counter!(
        names::PANICS_RECOVERED_TOTAL,
        "Total number of panics recovered by the recovery middleware"
    );
    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::RATE_LIMIT_EVICTIONS_TOTAL,
        "Total number of idle clients evicted from the rate limiter"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    describe_gauge!(
        names::RATE_LIMIT_TRACKED_CLIENTS,
        "Number of clients currently tracked by the rate limiter"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
///
/// This is useful for cases where metrics are optional.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// Record one completed request.
pub fn record_request(
    method: &str,
    route: &str,
    status: u16,
    duration_secs: f64,
    request_bytes: u64,
    response_bytes: u64,
) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status", status.to_string()),
    ];

    histogram!(names::REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
    counter!(names::REQUEST_BODY_BYTES_TOTAL, &labels).increment(request_bytes);
    counter!(names::RESPONSE_BODY_BYTES_TOTAL, &labels).increment(response_bytes);
}

// =============================================================================
// Middleware Counters
// =============================================================================

/// Record a panic caught by the recovery middleware.
pub fn record_panic_recovered() {
    counter!(names::PANICS_RECOVERED_TOTAL).increment(1);
}

/// Record a request rejected with 429.
pub fn record_rate_limit_rejection() {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
}

/// Record clients evicted by one janitor pass.
pub fn record_rate_limit_evictions(count: u64) {
    counter!(names::RATE_LIMIT_EVICTIONS_TOTAL).increment(count);
}

// =============================================================================
// Gauges
// =============================================================================

/// Update the tracked-clients gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_rate_limit_tracked_clients(count: usize) {
    gauge!(names::RATE_LIMIT_TRACKED_CLIENTS).set(count as f64);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // These only check the functions don't panic without a recorder.
    // Rendering is covered by the request metrics middleware tests.

    #[test]
    fn test_record_request() {
        record_request("GET", "/", 200, 0.1, 0, 42);
    }

    #[test]
    fn test_middleware_counters() {
        record_panic_recovered();
        record_rate_limit_rejection();
        record_rate_limit_evictions(3);
    }

    #[test]
    fn test_set_tracked_clients() {
        set_rate_limit_tracked_clients(0);
        set_rate_limit_tracked_clients(10_000);
    }

    #[tokio::test]
    async fn test_init_fails_when_port_is_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let err = init_metrics(addr).unwrap_err();
        assert!(matches!(err, AppError::Metrics(_)));
        assert_eq!(err.exit_code(), exitcode::UNAVAILABLE);

        // Logged and swallowed.
        try_init_metrics(addr);
    }
}
