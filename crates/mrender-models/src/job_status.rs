//! Job status snapshots for polling.
//!
//! The worker keeps one snapshot per job and updates it on every lifecycle
//! transition, so status queries never touch the running render.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::event::FailureReason;
use crate::job::{InvalidTransition, Job, JobId, JobState};

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStatus {
    /// Unique job identifier
    pub job_id: JobId,
    /// Scene class being rendered (unknown for jobs restored from disk)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// Current lifecycle state
    pub state: JobState,
    /// Artifact path once succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    /// Failure reason once failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Engine exit code, when the engine has exited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Number of output lines streamed so far
    pub lines_streamed: u64,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the snapshot was last updated
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    /// Snapshot a freshly created job.
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            entry_point: Some(job.entry_point.clone()),
            state: job.state,
            artifact_path: job
                .artifact_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            failure: None,
            exit_code: None,
            lines_streamed: 0,
            created_at: job.created_at,
            updated_at: job.created_at,
        }
    }

    /// Snapshot for a job only known through its persisted artifact record.
    pub fn recorded(job_id: JobId, artifact_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            entry_point: None,
            state: JobState::Succeeded,
            artifact_path: Some(artifact_path.into()),
            failure: None,
            exit_code: None,
            lines_streamed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Mark the engine as started.
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.state = self.state.transition(JobState::Running)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Count streamed lines.
    pub fn add_lines(&mut self, count: u64) {
        self.lines_streamed += count;
        self.updated_at = Utc::now();
    }

    /// Mark job as succeeded.
    pub fn succeed(
        &mut self,
        artifact_path: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.transition(JobState::Succeeded)?;
        self.artifact_path = Some(artifact_path.into());
        self.exit_code = exit_code;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark job as failed.
    pub fn fail(
        &mut self,
        reason: FailureReason,
        exit_code: Option<i32>,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.transition(JobState::Failed)?;
        self.failure = Some(reason);
        self.exit_code = exit_code;
        self.updated_at = Utc::now();
        Ok(())
    }
}
