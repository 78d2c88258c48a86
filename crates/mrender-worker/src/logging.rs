//! Structured render job logging.

use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn, Span};

use mrender_models::{FailureReason, Job, JobId};

/// Logs the lifecycle of one render.
///
/// Every record carries `job_id` and `entry_point` as fields, so a render can
/// be followed through the log with a single filter.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: JobId,
    entry_point: String,
}

impl JobLogger {
    pub fn new(job: &Job) -> Self {
        Self {
            job_id: job.id,
            entry_point: job.entry_point.clone(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn started(&self, workspace: &Path) {
        info!(
            job_id = %self.job_id,
            entry_point = %self.entry_point,
            workspace = %workspace.display(),
            "Render started"
        );
    }

    pub fn artifact_reported(&self, path: &Path) {
        info!(
            job_id = %self.job_id,
            entry_point = %self.entry_point,
            path = %path.display(),
            "Engine reported artifact"
        );
    }

    pub fn warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            entry_point = %self.entry_point,
            "Render warning: {}", message
        );
    }

    pub fn error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            entry_point = %self.entry_point,
            "Render error: {}", message
        );
    }

    pub fn succeeded(&self, artifact: &Path, lines: u64, elapsed: Duration) {
        info!(
            job_id = %self.job_id,
            entry_point = %self.entry_point,
            artifact = %artifact.display(),
            lines,
            elapsed_ms = elapsed.as_millis() as u64,
            "Render succeeded"
        );
    }

    /// Failures the engine caused are warnings; the rest are errors.
    pub fn failed(
        &self,
        reason: FailureReason,
        exit_code: Option<i32>,
        lines: u64,
        elapsed: Duration,
    ) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match reason {
            FailureReason::SpawnFailed | FailureReason::RecordFailed => error!(
                job_id = %self.job_id,
                entry_point = %self.entry_point,
                reason = %reason,
                ?exit_code,
                lines,
                elapsed_ms,
                "Render failed"
            ),
            _ => warn!(
                job_id = %self.job_id,
                entry_point = %self.entry_point,
                reason = %reason,
                ?exit_code,
                lines,
                elapsed_ms,
                "Render failed"
            ),
        }
    }

    /// Span wrapping everything the job's driver task does.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "render_job",
            job_id = %self.job_id,
            entry_point = %self.entry_point
        )
    }
}
