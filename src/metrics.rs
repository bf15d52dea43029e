//! Prometheus metrics for the request pipeline.
//!
//! Metrics are exposed via a dedicated HTTP listener when `METRICS_PORT` is
//! set. Recording without an installed exporter is a no-op.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `pipeline_requests_total` - Completed requests (labels: status, code)
//! - `pipeline_rate_limited_total` - Requests rejected by the rate limiter
//! - `pipeline_auth_failures_total` - Failed authentications (label: reason)
//! - `pipeline_validation_failures_total` - Rejected inputs (label: reason)
//!
//! ## Histograms
//! - `pipeline_request_duration_seconds` - Request duration (labels: method, status)
//!
//! # Usage
//!
//! ```rust,ignore
//! use request_pipeline::metrics::{init_metrics, record_request};
//!
//! // Initialize metrics (call once at startup)
//! init_metrics("0.0.0.0:9090".parse()?)?;
//!
//! record_request("GET", 200, "OK", 0.012);
//! ```

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "pipeline_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "pipeline_request_duration_seconds";
    pub const RATE_LIMITED_TOTAL: &str = "pipeline_rate_limited_total";
    pub const AUTH_FAILURES_TOTAL: &str = "pipeline_auth_failures_total";
    pub const VALIDATION_FAILURES_TOTAL: &str = "pipeline_validation_failures_total";
}

/// Install the Prometheus exporter listening on `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total number of requests completed by the pipeline"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of failed authentications"
    );
    describe_counter!(
        names::VALIDATION_FAILURES_TOTAL,
        "Total number of requests rejected by schema validation"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Request duration through the pipeline in seconds"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Record one completed request. `code` is the error code, or `OK`.
pub fn record_request(method: &str, status: u16, code: &str, duration_secs: f64) {
    let status = status.to_string();
    counter!(names::REQUESTS_TOTAL, "status" => status.clone(), "code" => code.to_string())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status)
        .record(duration_secs);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_auth_failure(reason: &str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_validation_failure(reason: &str) {
    counter!(names::VALIDATION_FAILURES_TOTAL, "reason" => reason.to_string()).increment(1);
}
