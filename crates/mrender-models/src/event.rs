//! Render events streamed to callers.
//!
//! A job stream is a sequence of `log` events followed by exactly one terminal
//! event. The same sequence is written either as newline-delimited JSON or in
//! the plain-text framing with in-band sentinels understood by older clients.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::{download_path, JobId};

/// Prefix of the plain-text success sentinel.
pub const DONE_SENTINEL: &str = "::done::";

/// Prefix of the plain-text failure sentinel.
pub const ERROR_SENTINEL: &str = "::error::";

/// Why a job ended without an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Engine could not be started
    SpawnFailed,
    /// Engine exited without printing the artifact marker
    NoArtifact,
    /// Marker seen but the engine exited non-zero (strict success policy)
    NonZeroExit,
    /// Cancelled by a caller or by shutdown
    Cancelled,
    /// Render deadline exceeded
    TimedOut,
    /// Artifact record could not be persisted
    RecordFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::SpawnFailed => "spawn_failed",
            FailureReason::NoArtifact => "no_artifact",
            FailureReason::NonZeroExit => "non_zero_exit",
            FailureReason::Cancelled => "cancelled",
            FailureReason::TimedOut => "timed_out",
            FailureReason::RecordFailed => "record_failed",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event envelope for a job stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderEvent {
    /// One line of engine output, verbatim
    Log { line: String },

    /// Render finished and the artifact was recorded
    Succeeded {
        job_id: JobId,
        download_path: String,
        artifact_path: String,
    },

    /// Render finished without an artifact
    Failed {
        job_id: JobId,
        reason: FailureReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}

impl RenderEvent {
    /// Create a log event.
    pub fn log(line: impl Into<String>) -> Self {
        Self::Log { line: line.into() }
    }

    /// Create a success event.
    pub fn succeeded(job_id: JobId, artifact_path: impl Into<String>) -> Self {
        Self::Succeeded {
            job_id,
            download_path: download_path(&job_id),
            artifact_path: artifact_path.into(),
        }
    }

    /// Create a failure event.
    pub fn failed(job_id: JobId, reason: FailureReason, exit_code: Option<i32>) -> Self {
        Self::Failed {
            job_id,
            reason,
            exit_code,
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RenderEvent::Log { .. })
    }

    /// Encode in the plain-text framing.
    ///
    /// Log lines are written verbatim with a trailing newline. Terminal events
    /// become `\n::done:: <path>\n` or `\n::error:: Rendering failed\n`.
    pub fn to_sentinel_text(&self) -> String {
        match self {
            RenderEvent::Log { line } => format!("{}\n", line),
            RenderEvent::Succeeded { download_path, .. } => {
                format!("\n{} {}\n", DONE_SENTINEL, download_path)
            }
            RenderEvent::Failed { .. } => format!("\n{} Rendering failed\n", ERROR_SENTINEL),
        }
    }

    /// Encode as one line of newline-delimited JSON.
    pub fn to_ndjson_line(&self) -> String {
        // Serializing this enum cannot fail: every field is a string, integer or unit variant.
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}
