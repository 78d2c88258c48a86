//! Worker error types.

use thiserror::Error;

use mrender_engine::EngineError;
use mrender_storage::StorageError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Workspace could not be created: {0}")]
    Workspace(#[source] StorageError),

    #[error("Render engine failed to start: {0}")]
    Engine(#[from] EngineError),

    #[error("Render capacity exhausted ({limit} jobs in flight)")]
    Busy { limit: usize },

    #[error("Job is not running: {0}")]
    JobNotActive(String),

    #[error("Worker is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl WorkerError {
    pub fn job_not_active(job_id: impl ToString) -> Self {
        Self::JobNotActive(job_id.to_string())
    }

    /// Whether the request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::Busy { .. })
    }
}
