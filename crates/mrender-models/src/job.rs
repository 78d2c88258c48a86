//! Render job definitions.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a render job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job ID from its string form.
    ///
    /// Returns `None` for anything that is not a UUID, so callers never build
    /// filesystem paths out of untrusted input.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Retrieval path handed to callers once a job has succeeded.
pub fn download_path(job_id: &JobId) -> String {
    format!("/download/{}", job_id)
}

/// Lifecycle state of a render job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Workspace created, engine not started yet
    #[default]
    Pending,
    /// Engine running, output streaming
    Running,
    /// Marker observed and artifact recorded
    Succeeded,
    /// Engine ended without a usable artifact
    Failed,
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }

    /// Validate a transition, returning the new state.
    pub fn transition(self, next: JobState) -> Result<JobState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A render request tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Scene class the engine should render
    pub entry_point: String,

    /// Submitted source code
    pub source_code: String,

    /// Directory owned exclusively by this job
    pub workspace: PathBuf,

    /// Source file written inside the workspace
    pub source_path: PathBuf,

    /// Current lifecycle state
    #[serde(default)]
    pub state: JobState,

    /// Artifact discovered by the marker scanner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,

    /// When the job was created
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job for an already allocated workspace.
    pub fn new(
        id: JobId,
        entry_point: impl Into<String>,
        source_code: impl Into<String>,
        workspace: impl Into<PathBuf>,
        source_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            entry_point: entry_point.into(),
            source_code: source_code.into(),
            workspace: workspace.into(),
            source_path: source_path.into(),
            state: JobState::Pending,
            artifact_path: None,
            created_at: Utc::now(),
        }
    }

    /// Move the job to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        self.state = self.state.transition(next)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_round_trips_through_display() {
        let id = JobId::new();
        assert_eq!(JobId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn test_job_id_rejects_non_uuid() {
        assert!(JobId::parse("../../etc/passwd").is_none());
        assert!(JobId::parse("").is_none());
        assert!(JobId::parse("not-a-job").is_none());
    }

    #[test]
    fn test_download_path() {
        let id = JobId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            download_path(&id),
            "/download/550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut job = Job::new(JobId::new(), "MyScene", "code", "/tmp/w", "/tmp/w/input.py");
        assert_eq!(job.state, JobState::Pending);

        job.advance(JobState::Running).unwrap();
        job.advance(JobState::Succeeded).unwrap();
        assert!(job.state.is_terminal());

        // Terminal states are never reopened
        let err = job.advance(JobState::Running).unwrap_err();
        assert_eq!(err.from, JobState::Succeeded);
        assert!(job.advance(JobState::Failed).is_err());
    }

    #[test]
    fn test_pending_can_fail_without_running() {
        assert!(JobState::Pending.can_transition_to(JobState::Failed));
        assert!(!JobState::Pending.can_transition_to(JobState::Succeeded));
    }
}
