//! Prometheus metrics for middleware observability.
//!
//! Metrics are exposed via a dedicated HTTP endpoint on the configured
//! metrics address (default: `0.0.0.0:9090`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `tenantguard_rate_limit_rejections_total` - Requests rejected by the rate limiter (label: class)
//! - `tenantguard_pipeline_rejections_total` - Requests short-circuited by a pipeline check (label: check)
//! - `tenantguard_tenant_violations_total` - Tenant isolation violations detected (label: severity)
//! - `tenantguard_slo_breaches_total` - SLO threshold breaches (label: kind)
//! - `tenantguard_idempotency_replays_total` - Requests answered from an existing idempotency record
//!
//! ## Histograms
//! - `tenantguard_request_duration_seconds` - Full request duration (labels: endpoint, method, status)
//! - `tenantguard_pipeline_overhead_seconds` - Time spent in pipeline checks before the handler
//!
//! ## Gauges
//! - `tenantguard_store_failure_mode` - Last observed store health (0 = healthy, 1 = failing)

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "tenantguard_rate_limit_rejections_total";
    pub const PIPELINE_REJECTIONS_TOTAL: &str = "tenantguard_pipeline_rejections_total";
    pub const TENANT_VIOLATIONS_TOTAL: &str = "tenantguard_tenant_violations_total";
    pub const SLO_BREACHES_TOTAL: &str = "tenantguard_slo_breaches_total";
    pub const IDEMPOTENCY_REPLAYS_TOTAL: &str = "tenantguard_idempotency_replays_total";
    pub const REQUEST_DURATION_SECONDS: &str = "tenantguard_request_duration_seconds";
    pub const PIPELINE_OVERHEAD_SECONDS: &str = "tenantguard_pipeline_overhead_seconds";
    pub const STORE_FAILURE_MODE: &str = "tenantguard_store_failure_mode";
}

/// Initialize the Prometheus metrics exporter.
///
/// Sets up metric descriptions and starts the Prometheus HTTP listener on
/// the given address.
///
/// # Errors
///
/// Returns a message when the exporter cannot be installed (for example
/// when the listener address is already bound).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Total requests rejected by the rate limiter"
    );
    describe_counter!(
        names::PIPELINE_REJECTIONS_TOTAL,
        "Total requests short-circuited by a pipeline check"
    );
    describe_counter!(
        names::TENANT_VIOLATIONS_TOTAL,
        "Total tenant isolation violations detected"
    );
    describe_counter!(
        names::SLO_BREACHES_TOTAL,
        "Total SLO threshold breaches"
    );
    describe_counter!(
        names::IDEMPOTENCY_REPLAYS_TOTAL,
        "Total requests answered from an existing idempotency record"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Full HTTP request duration in seconds"
    );
    describe_histogram!(
        names::PIPELINE_OVERHEAD_SECONDS,
        "Time spent in pipeline checks before the handler, in seconds"
    );

    describe_gauge!(
        names::STORE_FAILURE_MODE,
        "Last observed shared-store health (0 = healthy, 1 = failing)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record a rate limiter rejection for a limiter class.
pub fn record_rate_limit_rejection(class: &str) {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL, "class" => class.to_string()).increment(1);
}

/// Record a request short-circuited by a pipeline check.
pub fn record_pipeline_rejection(check: &str) {
    counter!(names::PIPELINE_REJECTIONS_TOTAL, "check" => check.to_string()).increment(1);
}

/// Record a detected tenant isolation violation.
pub fn record_tenant_violation(severity: &str) {
    counter!(names::TENANT_VIOLATIONS_TOTAL, "severity" => severity.to_string()).increment(1);
}

/// Record an SLO threshold breach.
pub fn record_slo_breach(kind: &str) {
    counter!(names::SLO_BREACHES_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Record a duplicate request answered from an idempotency record.
pub fn record_idempotency_replay() {
    counter!(names::IDEMPOTENCY_REPLAYS_TOTAL).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record full HTTP request duration.
pub fn record_request_duration(endpoint: &str, method: &str, status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "endpoint" => endpoint.to_string(), "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

/// Record time spent in pipeline checks before the handler ran.
pub fn record_pipeline_overhead(duration_secs: f64) {
    histogram!(names::PIPELINE_OVERHEAD_SECONDS).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Update the observed store health gauge.
pub fn set_store_failure_mode(failing: bool) {
    gauge!(names::STORE_FAILURE_MODE).set(if failing { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests verify the functions don't panic without an installed
    // recorder. Full metrics testing requires a Prometheus scraper.

    #[test]
    fn test_record_rate_limit_rejection() {
        record_rate_limit_rejection("api");
    }

    #[test]
    fn test_record_pipeline_rejection() {
        record_pipeline_rejection("signature");
    }

    #[test]
    fn test_record_tenant_violation() {
        record_tenant_violation("CRITICAL");
    }

    #[test]
    fn test_record_request_duration() {
        record_request_duration("/v1/reports", "GET", 200, 0.042);
    }

    #[test]
    fn test_set_store_failure_mode() {
        set_store_failure_mode(true);
        set_store_failure_mode(false);
    }
}
