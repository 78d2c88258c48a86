//! Render job metrics.
//!
//! Recorded through the `metrics` facade; the API process installs the
//! Prometheus recorder. Without a recorder these calls are no-ops.

use metrics::{counter, gauge, histogram};

use mrender_models::FailureReason;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_SUBMITTED_TOTAL: &str = "mrender_jobs_submitted_total";
    pub const JOBS_REJECTED_TOTAL: &str = "mrender_jobs_rejected_total";
    pub const JOBS_SUCCEEDED_TOTAL: &str = "mrender_jobs_succeeded_total";
    pub const JOBS_FAILED_TOTAL: &str = "mrender_jobs_failed_total";
    pub const JOBS_RUNNING: &str = "mrender_jobs_running";
    pub const RENDER_DURATION_SECONDS: &str = "mrender_render_duration_seconds";
    pub const OUTPUT_LINES_TOTAL: &str = "mrender_output_lines_total";
}

pub fn record_job_submitted() {
    counter!(names::JOBS_SUBMITTED_TOTAL).increment(1);
}

/// Record a submission refused because the pool was full.
pub fn record_job_rejected() {
    counter!(names::JOBS_REJECTED_TOTAL).increment(1);
}

pub fn record_job_succeeded(duration_secs: f64) {
    counter!(names::JOBS_SUCCEEDED_TOTAL).increment(1);
    histogram!(names::RENDER_DURATION_SECONDS, "outcome" => "succeeded").record(duration_secs);
}

pub fn record_job_failed(reason: FailureReason, duration_secs: f64) {
    counter!(names::JOBS_FAILED_TOTAL, "reason" => reason.as_str()).increment(1);
    histogram!(names::RENDER_DURATION_SECONDS, "outcome" => "failed").record(duration_secs);
}

pub fn set_running_jobs(count: usize) {
    gauge!(names::JOBS_RUNNING).set(count as f64);
}

pub fn record_output_line() {
    counter!(names::OUTPUT_LINES_TOTAL).increment(1);
}
