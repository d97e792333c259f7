/// Metrics for FillTheHole
///
/// Prometheus-compatible counters for:
/// - HTTP request counts and latencies
/// - Report and fill outcomes
/// - Photo moderation results
/// - Authentication attempts, throttling and session timeouts
/// - Background job execution

use crate::error::{HoleError, HoleResult};
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, route and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("http_requests_total registers once");

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("http_request_duration_seconds registers once");

    /// Requests currently in flight
    pub static ref HTTP_REQUESTS_ACTIVE: IntGauge = register_int_gauge!(
        "http_requests_active",
        "Number of HTTP requests currently being processed"
    )
    .expect("http_requests_active registers once");

    // ========== Report Metrics ==========

    /// Citizen reports by outcome (created, confirmed, duplicate)
    pub static ref REPORT_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pothole_report_outcomes_total",
        "Pothole report submissions by outcome",
        &["outcome"]
    )
    .expect("pothole_report_outcomes_total registers once");

    /// Fill requests by outcome
    pub static ref FILL_OUTCOMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pothole_fill_outcomes_total",
        "Pothole fill requests by outcome",
        &["outcome"]
    )
    .expect("pothole_fill_outcomes_total registers once");

    /// Photo uploads by result (accepted, rejected)
    pub static ref PHOTO_UPLOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pothole_photo_uploads_total",
        "Photo uploads by moderation result",
        &["result"]
    )
    .expect("pothole_photo_uploads_total registers once");

    // ========== Security Metrics ==========

    /// Authentication attempts by type and outcome
    pub static ref AUTH_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "admin_auth_attempts_total",
        "Admin authentication attempts",
        &["attempt_type", "outcome"]
    )
    .expect("admin_auth_attempts_total registers once");

    /// Requests refused by a throttle
    pub static ref RATE_LIMIT_REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rate_limit_rejections_total",
        "Requests refused by a rate limit",
        &["scope"]
    )
    .expect("rate_limit_rejections_total registers once");

    /// Sessions ended by an inactivity or absolute timeout
    pub static ref SESSION_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "admin_session_timeouts_total",
        "Admin sessions ended by timeout",
        &["reason"]
    )
    .expect("admin_session_timeouts_total registers once");

    // ========== Background Job Metrics ==========

    /// Background job executions by job type and status
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background job executions",
        &["job_type", "status"]
    )
    .expect("background_jobs_total registers once");

    // ========== System Metrics ==========

    /// Application uptime in seconds
    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "uptime_seconds",
        "Application uptime in seconds"
    )
    .expect("uptime_seconds registers once");
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> HoleResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| HoleError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| HoleError::Internal(format!("Invalid metrics text: {}", e)))
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, success: bool) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, if success { "success" } else { "failure" }])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_http_request("GET", "/api/potholes", 200, 0.01);
        REPORT_OUTCOMES_TOTAL.with_label_values(&["created"]).inc();

        let text = render_metrics().unwrap();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains("pothole_report_outcomes_total"));
    }
}
