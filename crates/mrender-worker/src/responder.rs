//! Streaming responder.
//!
//! Drives one running render: forwards every output line to the caller as it
//! arrives, watches for the artifact marker, and once the engine has exited
//! records the artifact and sends exactly one terminal event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use mrender_engine::{MarkerScanner, RenderProcess};
use mrender_models::{FailureReason, Job, JobId, JobState, RenderEvent};
use mrender_storage::{resolve_artifact_path, ArtifactStore};

use crate::config::SuccessPolicy;
use crate::logging::JobLogger;
use crate::metrics;
use crate::registry::JobRegistry;

/// Knobs the responder needs from the worker configuration.
#[derive(Debug, Clone, Copy)]
pub struct ResponderSettings {
    pub timeout: Option<Duration>,
    pub success_policy: SuccessPolicy,
    pub terminate_grace: Duration,
}

/// Final result of a render.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub state: JobState,
    pub artifact_path: Option<PathBuf>,
    pub failure: Option<FailureReason>,
    pub exit_code: Option<i32>,
    pub lines: u64,
}

/// Decide the outcome once the engine has exited.
///
/// An interruption always fails the job, even if the marker was already seen.
pub fn decide_outcome(
    interrupted: Option<FailureReason>,
    artifact: Option<PathBuf>,
    exit_code: Option<i32>,
    policy: SuccessPolicy,
) -> Result<PathBuf, FailureReason> {
    if let Some(reason) = interrupted {
        return Err(reason);
    }
    let Some(artifact) = artifact else {
        return Err(FailureReason::NoArtifact);
    };
    if policy == SuccessPolicy::MarkerAndZeroExit && exit_code != Some(0) {
        return Err(FailureReason::NonZeroExit);
    }
    Ok(artifact)
}

pub struct StreamingResponder {
    job: Job,
    process: RenderProcess,
    events: mpsc::Sender<RenderEvent>,
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<JobRegistry>,
    cancel: watch::Receiver<bool>,
    settings: ResponderSettings,
    logger: JobLogger,
    on_finished: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamingResponder {
    pub fn new(
        job: Job,
        process: RenderProcess,
        events: mpsc::Sender<RenderEvent>,
        artifacts: Arc<dyn ArtifactStore>,
        registry: Arc<JobRegistry>,
        cancel: watch::Receiver<bool>,
        settings: ResponderSettings,
    ) -> Self {
        let logger = JobLogger::new(&job);
        Self {
            job,
            process,
            events,
            artifacts,
            registry,
            cancel,
            settings,
            logger,
            on_finished: None,
        }
    }

    /// Run `f` once the outcome is recorded, before the terminal event is
    /// handed to the caller. A caller that stops reading can hold up that
    /// delivery, so resources tied to the render are released here.
    pub fn on_finished(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_finished = Some(Box::new(f));
        self
    }

    /// Run the render to completion.
    ///
    /// A caller that stops reading does not stop the render: the remaining
    /// output is drained and the artifact is still recorded.
    pub async fn run(self) -> JobOutcome {
        let span = self.logger.span();
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> JobOutcome {
        let started = Instant::now();
        let deadline = self.settings.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut scanner = MarkerScanner::new();
        let mut lines = 0u64;
        let mut caller_gone = false;
        let mut interrupted = None;

        self.logger.started(&self.job.workspace);

        loop {
            tokio::select! {
                line = self.process.next_line() => {
                    let Some(line) = line else { break };
                    lines += 1;
                    metrics::record_output_line();
                    self.registry.add_lines(&self.job.id, 1).await;

                    if let Some(path) = scanner.observe(&line) {
                        self.logger.artifact_reported(path);
                    }

                    if caller_gone {
                        continue;
                    }
                    // A full channel must not keep cancel and deadline from firing.
                    tokio::select! {
                        sent = self.events.send(RenderEvent::log(line)) => {
                            if sent.is_err() {
                                caller_gone = true;
                                self.logger.warning("caller disconnected, render continues");
                            }
                        }
                        reason = wait_for_interrupt(&mut self.cancel, deadline) => {
                            interrupted = Some(reason);
                            break;
                        }
                    }
                }
                reason = wait_for_interrupt(&mut self.cancel, deadline) => {
                    interrupted = Some(reason);
                    break;
                }
            }
        }

        // Output can close before the process exits; keep honoring cancel and
        // deadline while waiting.
        let mut exit = None;
        if interrupted.is_none() {
            tokio::select! {
                status = self.process.wait() => exit = Some(status),
                reason = wait_for_interrupt(&mut self.cancel, deadline) => interrupted = Some(reason),
            }
        }
        let status = match exit {
            Some(status) => status,
            None => {
                self.logger.warning(&format!(
                    "stopping engine ({})",
                    interrupted.unwrap_or(FailureReason::Cancelled)
                ));
                self.process.terminate(self.settings.terminate_grace).await
            }
        };

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                self.logger
                    .error(&format!("failed to collect exit status: {}", e));
                None
            }
        };

        let decision = decide_outcome(
            interrupted,
            scanner.into_artifact(),
            exit_code,
            self.settings.success_policy,
        );

        let decision = match decision {
            Ok(reported) => {
                let artifact = resolve_artifact_path(&self.job.workspace, &reported);
                match self.artifacts.record(&self.job.id, &artifact).await {
                    Ok(()) => Ok(artifact),
                    Err(e) => {
                        self.logger.error(&format!("artifact record failed: {}", e));
                        Err(FailureReason::RecordFailed)
                    }
                }
            }
            Err(reason) => Err(reason),
        };

        let elapsed = started.elapsed();
        let (event, outcome) = match decision {
            Ok(artifact) => {
                self.registry
                    .finish_succeeded(&self.job.id, &artifact, exit_code)
                    .await;
                metrics::record_job_succeeded(elapsed.as_secs_f64());
                self.logger.succeeded(&artifact, lines, elapsed);
                (
                    RenderEvent::succeeded(self.job.id, artifact.to_string_lossy()),
                    JobOutcome {
                        job_id: self.job.id,
                        state: JobState::Succeeded,
                        artifact_path: Some(artifact),
                        failure: None,
                        exit_code,
                        lines,
                    },
                )
            }
            Err(reason) => {
                self.registry
                    .finish_failed(&self.job.id, reason, exit_code)
                    .await;
                metrics::record_job_failed(reason, elapsed.as_secs_f64());
                self.logger.failed(reason, exit_code, lines, elapsed);
                (
                    RenderEvent::failed(self.job.id, reason, exit_code),
                    JobOutcome {
                        job_id: self.job.id,
                        state: JobState::Failed,
                        artifact_path: None,
                        failure: Some(reason),
                        exit_code,
                        lines,
                    },
                )
            }
        };

        if let Some(finished) = self.on_finished.take() {
            finished();
        }
        if !caller_gone {
            let _ = self.events.send(event).await;
        }
        outcome
    }
}

/// Resolve when the job is cancelled or its deadline passes.
async fn wait_for_interrupt(
    cancel: &mut watch::Receiver<bool>,
    deadline: Option<tokio::time::Instant>,
) -> FailureReason {
    let cancelled = async {
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            if cancel.changed().await.is_err() {
                // Sender gone without a cancel request: never fires.
                std::future::pending::<()>().await;
            }
        }
    };
    let timed_out = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = cancelled => FailureReason::Cancelled,
        _ = timed_out => FailureReason::TimedOut,
    }
}
