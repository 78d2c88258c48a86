//! Liveness and readiness probes.

use std::fmt::Display;
use std::future::Future;
use std::path::Path;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use mrender_engine::check_engine;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

/// `GET /health`: the process is up. Says nothing about the engine.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub engine: Check,
    pub artifacts: Check,
    pub jobs_in_flight: usize,
    pub jobs_running: usize,
    pub max_concurrent_jobs: usize,
}

/// Result of one readiness check.
#[derive(Serialize)]
pub struct Check {
    pub ok: bool,
    /// Resolved engine path or artifacts root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

async fn timed<T, E, F>(check: F) -> Check
where
    T: Display,
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let result = check.await;
    let latency_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(detail) => Check {
            ok: true,
            detail: Some(detail.to_string()),
            error: None,
            latency_ms,
        },
        Err(e) => Check {
            ok: false,
            detail: None,
            error: Some(e.to_string()),
            latency_ms,
        },
    }
}

/// `GET /ready`: the engine resolves on PATH and the artifacts root accepts
/// writes. 503 with per-check detail otherwise.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let executor = &state.executor;
    let config = executor.config();

    let engine = timed(async {
        check_engine(&config.engine_program).map(|path| path.display().to_string())
    })
    .await;
    let artifacts = timed(async {
        let root = executor.workspaces().root();
        probe_writable(root)
            .await
            .map(|()| root.display().to_string())
    })
    .await;

    let ready = engine.ok && artifacts.ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "degraded" },
            engine,
            artifacts,
            jobs_in_flight: executor.in_flight(),
            jobs_running: executor.running().await,
            max_concurrent_jobs: config.max_concurrent_jobs,
        }),
    )
}

async fn probe_writable(root: &Path) -> std::io::Result<()> {
    let probe = root.join(format!(".ready-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await
}
