//! Prometheus metrics for the API server.

use std::sync::LazyLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use regex::Regex;

static JOB_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/download|/api/jobs)/[^/]+").expect("job segment pattern is valid")
});

/// Renders take seconds to minutes; HTTP handlers milliseconds.
const RENDER_DURATION_BUCKETS: &[f64] = &[
    1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];
const HTTP_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Install the Prometheus recorder.
///
/// Job metrics recorded by the worker crate go through the same recorder.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(mrender_worker::metrics::names::RENDER_DURATION_SECONDS.to_string()),
            RENDER_DURATION_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(names::HTTP_REQUEST_DURATION_SECONDS.to_string()),
            HTTP_DURATION_BUCKETS,
        )?
        .install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "mrender_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "mrender_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "mrender_http_requests_in_flight";

    // Artifact delivery
    pub const DOWNLOADS_TOTAL: &str = "mrender_downloads_total";

    // Code generation
    pub const GENERATIONS_TOTAL: &str = "mrender_generations_total";

    // Rate limiting metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "mrender_rate_limit_hits_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a download attempt by outcome (`served`, `not_found`, `artifact_missing`).
pub fn record_download(outcome: &'static str) {
    counter!(names::DOWNLOADS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_generation(outcome: &'static str) {
    counter!(names::GENERATIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", sanitize_path(endpoint))];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Sanitize path for metrics labels (job ids, valid or not, become `:id`).
fn sanitize_path(path: &str) -> String {
    JOB_SEGMENT_RE.replace(path, "$1/:id").into_owned()
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    // Streaming responses are measured to the first byte, not to the end of the render.
    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
