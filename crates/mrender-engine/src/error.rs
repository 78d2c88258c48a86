//! Error types for engine operations.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while starting or supervising the render engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Render engine '{0}' not found in PATH")]
    EngineNotFound(String),

    #[error("Failed to spawn render engine '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create output pipe: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create a spawn failure error.
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            source,
        }
    }

    /// Whether the error happened before the engine produced any output.
    pub fn is_spawn_error(&self) -> bool {
        matches!(
            self,
            EngineError::EngineNotFound(_) | EngineError::SpawnFailed { .. } | EngineError::Pipe(_)
        )
    }
}
