//! Render job handlers: submit-and-stream, status, cancel.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::{Form, Json};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::{Validate, ValidationError};

use mrender_models::{JobId, JobStatus, RenderEvent};
use mrender_worker::JobHandle;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Header carrying the job id on streamed responses.
pub const JOB_ID_HEADER: &str = "X-Job-Id";

/// Render submission.
#[derive(Debug, Deserialize, Validate)]
pub struct RenderRequest {
    /// Scene class to render
    #[validate(
        length(min = 1, max = 128, message = "scene_name must be 1-128 characters"),
        custom(function = "validate_scene_name")
    )]
    pub scene_name: String,
    /// Source code written to the job workspace
    #[validate(length(min = 1, message = "code must not be empty"))]
    pub code: String,
}

/// Scene names are Python identifiers, Unicode letters included. The leading
/// letter also keeps them from being read as flags.
fn validate_scene_name(name: &str) -> Result<(), ValidationError> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ValidationError::new("scene_name")
            .with_message("scene_name must be a Python class name".into()))
    }
}

/// Wire framing of a job stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Raw lines with `::done::` / `::error::` sentinels
    SentinelText,
    /// One JSON event per line
    Ndjson,
}

impl Framing {
    pub fn content_type(&self) -> &'static str {
        match self {
            Framing::SentinelText => "text/plain; charset=utf-8",
            Framing::Ndjson => "application/x-ndjson",
        }
    }

    pub fn encode(&self, event: &RenderEvent) -> String {
        match self {
            Framing::SentinelText => event.to_sentinel_text(),
            Framing::Ndjson => event.to_ndjson_line(),
        }
    }
}

/// `POST /convert/`: form submission streamed back as plain text.
pub async fn convert(
    State(state): State<AppState>,
    Form(request): Form<RenderRequest>,
) -> ApiResult<Response> {
    submit_and_stream(&state, request, Framing::SentinelText).await
}

/// `POST /api/jobs`: JSON submission streamed back as NDJSON events.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<RenderRequest>,
) -> ApiResult<Response> {
    submit_and_stream(&state, request, Framing::Ndjson).await
}

async fn submit_and_stream(
    state: &AppState,
    request: RenderRequest,
    framing: Framing,
) -> ApiResult<Response> {
    request
        .validate()
        .map_err(|e| ApiError::validation(e.to_string()))?;

    let handle = state
        .executor
        .submit(&request.scene_name, &request.code)
        .await?;

    info!(
        job_id = %handle.job_id,
        entry_point = %request.scene_name,
        "Render job accepted"
    );

    stream_response(handle, framing)
}

/// Turn a job's event channel into a streaming response body.
///
/// Every event is written as soon as it arrives. The body ends after the
/// terminal event, when the responder drops its sender.
pub fn stream_response(handle: JobHandle, framing: Framing) -> ApiResult<Response> {
    let JobHandle { job_id, events, .. } = handle;

    let body = stream::unfold(events, move |mut events| async move {
        let event = events.recv().await?;
        let chunk = Bytes::from(framing.encode(&event));
        Some((Ok::<_, Infallible>(chunk), events))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, framing.content_type())
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .header(JOB_ID_HEADER, job_id.to_string())
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}

/// `GET /api/jobs/:job_id`
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatus>> {
    let id = JobId::parse(&job_id).ok_or_else(|| ApiError::not_found(format!("Job {}", job_id)))?;

    state
        .executor
        .status(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job {}", job_id)))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub status: String,
}

/// `POST /api/jobs/:job_id/cancel`
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let id = JobId::parse(&job_id).ok_or_else(|| ApiError::not_found(format!("Job {}", job_id)))?;

    state.executor.cancel(&id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id: id.to_string(),
            status: "cancelling".to_string(),
        }),
    ))
}
