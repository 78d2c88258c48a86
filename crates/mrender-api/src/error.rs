//! API error types.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use mrender_storage::StorageError;
use mrender_worker::WorkerError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Detail returned for every download that cannot be served.
pub const ARTIFACT_UNAVAILABLE_DETAIL: &str = "Invalid job ID or rendering not finished yet.";

/// Seconds a client should wait before retrying a `Busy` submission.
pub const BUSY_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid job ID or rendering not finished yet.")]
    ArtifactUnavailable { code: &'static str },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Code generation is not configured")]
    GenerationNotConfigured,

    #[error("Code generation failed: {0}")]
    UpstreamGeneration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Worker(#[from] WorkerError),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => ApiError::ArtifactUnavailable { code: "not_found" },
            StorageError::ArtifactMissing(_) => ApiError::ArtifactUnavailable {
                code: "artifact_missing",
            },
            other => ApiError::Storage(other),
        }
    }
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamGeneration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) | ApiError::ArtifactUnavailable { .. } => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::GenerationNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamGeneration(_) => StatusCode::BAD_GATEWAY,
            ApiError::Worker(e) => match e {
                WorkerError::Busy { .. } | WorkerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                WorkerError::JobNotActive(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::ArtifactUnavailable { code } => *code,
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Validation(_) => "validation_error",
            ApiError::RateLimited => "rate_limited",
            ApiError::GenerationNotConfigured => "generation_not_configured",
            ApiError::UpstreamGeneration(_) => "upstream_error",
            ApiError::Worker(e) => match e {
                WorkerError::Busy { .. } => "busy",
                WorkerError::ShuttingDown => "shutting_down",
                WorkerError::JobNotActive(_) => "not_found",
                WorkerError::Workspace(_) => "workspace_error",
                WorkerError::Engine(_) => "spawn_error",
                WorkerError::Storage(_) => "internal_error",
            },
            ApiError::Internal(_) | ApiError::Storage(_) => "internal_error",
        }
    }

    fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if self.is_internal() {
            tracing::error!(code = self.code(), "Request failed: {}", self);
        }

        // Don't expose internal error details in production
        let detail = if self.is_internal()
            && std::env::var("ENVIRONMENT").unwrap_or_default() == "production"
        {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            detail,
            code: Some(self.code().to_string()),
        };

        let mut response = (status, Json(body)).into_response();
        if matches!(self, ApiError::Worker(WorkerError::Busy { .. })) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, BUSY_RETRY_AFTER_SECS.into());
        }
        response
    }
}
