//! Artifact download handler.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures_util::stream;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use mrender_storage::StorageError;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// `GET /download/:job_id` and `GET /api/jobs/:job_id/download`
pub async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let artifact = match state.downloads.fetch(&job_id).await {
        Ok(artifact) => artifact,
        Err(e) => {
            metrics::record_download(match &e {
                StorageError::ArtifactMissing(_) => "artifact_missing",
                StorageError::NotFound(_) => "not_found",
                _ => "error",
            });
            return Err(e.into());
        }
    };
    metrics::record_download("served");

    debug!(
        job_id = %artifact.job_id,
        bytes = artifact.len,
        "Streaming artifact {}",
        artifact.filename
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, artifact.content_type)
        .header(header::CONTENT_LENGTH, artifact.len)
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(&artifact.filename),
        )
        .header("Cross-Origin-Resource-Policy", "cross-origin")
        .body(Body::from_stream(file_chunks(artifact.file)))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}

/// Read a file as a stream of fixed-size chunks. Stops after the first error.
fn file_chunks(
    file: File,
) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
}

fn content_disposition(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    format!("attachment; filename=\"{}\"", safe)
}
