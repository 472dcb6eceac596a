//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Install the Prometheus recorder and serve `/metrics` on `port`.
pub fn init_metrics(port: u16) -> WorkerResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("Failed to install Prometheus exporter: {}", e)))
}

/// Metric names as constants for consistency.
pub mod names {
    // Run lifecycle
    pub const RUNS_STARTED_TOTAL: &str = "dsum_runs_started_total";
    pub const RUNS_REJECTED_TOTAL: &str = "dsum_runs_rejected_total";
    pub const RUNS_COMPLETED_TOTAL: &str = "dsum_runs_completed_total";
    pub const RUN_DURATION_SECONDS: &str = "dsum_run_duration_seconds";

    // Capture
    pub const FRAMES_CAPTURED_TOTAL: &str = "dsum_frames_captured_total";
    pub const SNAPSHOT_FAILURES_TOTAL: &str = "dsum_snapshot_failures_total";

    // Scoring
    pub const SCORING_CALLS_TOTAL: &str = "dsum_scoring_calls_total";
    pub const SCORING_DURATION_SECONDS: &str = "dsum_scoring_duration_seconds";

    // Cooldown
    pub const COOLDOWN_BACKOFF_SECONDS: &str = "dsum_cooldown_backoff_seconds";
}

pub fn record_run_started(bundle_key: &str) {
    let labels = [("bundle_key", bundle_key.to_string())];
    counter!(names::RUNS_STARTED_TOTAL, &labels).increment(1);
}

/// Record a trigger turned away by the scheduler.
pub fn record_run_rejected(bundle_key: &str, reason: &str) {
    let labels = [
        ("bundle_key", bundle_key.to_string()),
        ("reason", reason.to_string()),
    ];
    counter!(names::RUNS_REJECTED_TOTAL, &labels).increment(1);
}

pub fn record_run_completed(bundle_key: &str, outcome: &str, duration_secs: f64) {
    let labels = [
        ("bundle_key", bundle_key.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(names::RUNS_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::RUN_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_frame_captured(bundle_key: &str) {
    let labels = [("bundle_key", bundle_key.to_string())];
    counter!(names::FRAMES_CAPTURED_TOTAL, &labels).increment(1);
}

pub fn record_snapshot_failure(bundle_key: &str) {
    let labels = [("bundle_key", bundle_key.to_string())];
    counter!(names::SNAPSHOT_FAILURES_TOTAL, &labels).increment(1);
}

/// Record one external scoring call ("ok", "failed" or "timeout").
pub fn record_scoring_call(outcome: &str, duration_secs: f64) {
    let labels = [("outcome", outcome.to_string())];
    counter!(names::SCORING_CALLS_TOTAL, &labels).increment(1);
    histogram!(names::SCORING_DURATION_SECONDS).record(duration_secs);
}

pub fn set_cooldown_backoff(bundle_key: &str, backoff_secs: f64) {
    let labels = [("bundle_key", bundle_key.to_string())];
    gauge!(names::COOLDOWN_BACKOFF_SECONDS, &labels).set(backoff_secs);
}
