//! Storage error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create workspace at {path}: {source}")]
    WorkspaceCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No artifact recorded for job: {0}")]
    NotFound(String),

    #[error("Recorded artifact no longer exists: {0}")]
    ArtifactMissing(PathBuf),

    #[error("Failed to record artifact for job {job_id}: {source}")]
    RecordFailed {
        job_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn workspace_creation(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WorkspaceCreation {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(job_id: impl Into<String>) -> Self {
        Self::NotFound(job_id.into())
    }

    pub fn record_failed(job_id: impl Into<String>, source: std::io::Error) -> Self {
        Self::RecordFailed {
            job_id: job_id.into(),
            source,
        }
    }

    /// Whether the caller should see "not available" rather than a server error.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::NotFound(_) | StorageError::ArtifactMissing(_))
    }
}
