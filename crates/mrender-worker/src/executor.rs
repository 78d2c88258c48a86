//! Job executor.
//!
//! Accepts render jobs into a bounded pool. At most `max_concurrent_jobs`
//! engines run at once; up to `max_queued_jobs` more wait for a slot, and
//! anything beyond that is refused with `Busy` instead of queueing forever.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mrender_engine::RenderRunner;
use mrender_models::{FailureReason, JobId, JobStatus, RenderEvent};
use mrender_storage::{ArtifactStore, FsArtifactStore, WorkspaceStore};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::registry::JobRegistry;
use crate::responder::{JobOutcome, ResponderSettings, StreamingResponder};

/// A submitted job: its id and the stream of its events.
pub struct JobHandle {
    pub job_id: JobId,
    /// Log events followed by exactly one terminal event
    pub events: mpsc::Receiver<RenderEvent>,
    /// Driver task; dropping the handle does not stop the render
    pub completion: JoinHandle<JobOutcome>,
}

/// Runs render jobs in a bounded pool.
pub struct JobExecutor {
    config: WorkerConfig,
    workspaces: WorkspaceStore,
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<JobRegistry>,
    runner: RenderRunner,
    slots: Arc<Semaphore>,
    admitted: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        workspaces: WorkspaceStore,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));

        Self {
            config,
            workspaces,
            artifacts,
            registry: Arc::new(JobRegistry::default()),
            runner: RenderRunner::new(),
            slots,
            admitted: Arc::new(AtomicUsize::new(0)),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Open the artifacts root and use filesystem artifact records.
    pub async fn from_config(config: WorkerConfig) -> WorkerResult<Self> {
        let workspaces = WorkspaceStore::open(&config.artifacts_dir)
            .await
            .map_err(WorkerError::Workspace)?;
        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(FsArtifactStore::new(workspaces.root().to_path_buf()));

        info!(
            "Job executor using {} with {} render slots ({} queued)",
            workspaces.root().display(),
            config.max_concurrent_jobs,
            config.max_queued_jobs
        );

        Ok(Self::new(config, workspaces, artifacts))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.workspaces
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        Arc::clone(&self.artifacts)
    }

    /// Jobs accepted and not yet finished (running or waiting).
    pub fn in_flight(&self) -> usize {
        self.admitted.load(Ordering::SeqCst)
    }

    pub async fn running(&self) -> usize {
        self.registry.running().await
    }

    /// Submit a render job.
    ///
    /// Returns once the engine is running, so a spawn failure is reported
    /// here rather than as a stream event. The workspace of a job that fails
    /// to start is left in place.
    pub async fn submit(&self, entry_point: &str, source_code: &str) -> WorkerResult<JobHandle> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(WorkerError::ShuttingDown);
        }

        let limit = self.config.admission_limit().max(1);
        if self
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            metrics::record_job_rejected();
            warn!("Rejecting job for scene {}: {} jobs in flight", entry_point, limit);
            return Err(WorkerError::Busy { limit });
        }
        let admission = scopeguard::guard(Arc::clone(&self.admitted), |admitted| {
            admitted.fetch_sub(1, Ordering::SeqCst);
        });

        let job = self
            .workspaces
            .create_job(entry_point, source_code)
            .await
            .map_err(WorkerError::Workspace)?;
        self.registry.register(&job).await;
        metrics::record_job_submitted();

        // Until the responder owns the job, a dropped submit (a client that
        // goes away while queued) must not leave the entry pending forever.
        let registration = scopeguard::guard(
            (Arc::clone(&self.registry), job.id),
            |(registry, job_id)| abandon_registration(registry, job_id),
        );

        let permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                scopeguard::ScopeGuard::into_inner(registration);
                self.registry
                    .finish_failed(&job.id, FailureReason::Cancelled, None)
                    .await;
                return Err(WorkerError::ShuttingDown);
            }
        };

        let command = self.config.render_command(&job);
        let process = match self.runner.spawn(&command, &job.workspace) {
            Ok(process) => process,
            Err(e) => {
                warn!(job_id = %job.id, "Failed to start render engine: {}", e);
                scopeguard::ScopeGuard::into_inner(registration);
                self.registry
                    .finish_failed(&job.id, FailureReason::SpawnFailed, None)
                    .await;
                metrics::record_job_failed(FailureReason::SpawnFailed, 0.0);
                return Err(e.into());
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.registry.start(&job.id, cancel_tx).await;
        let max_slots = self.config.max_concurrent_jobs.max(1);
        metrics::set_running_jobs(max_slots.saturating_sub(self.slots.available_permits()));

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let job_id = job.id;
        let responder = StreamingResponder::new(
            job,
            process,
            events_tx,
            Arc::clone(&self.artifacts),
            Arc::clone(&self.registry),
            cancel_rx,
            ResponderSettings {
                timeout: self.config.render_timeout,
                success_policy: self.config.success_policy,
                terminate_grace: self.config.terminate_grace,
            },
        );

        let slots = Arc::clone(&self.slots);
        let responder = responder.on_finished(move || {
            drop(permit);
            drop(admission);
            metrics::set_running_jobs(max_slots.saturating_sub(slots.available_permits()));
        });
        let completion = tokio::spawn(responder.run());
        scopeguard::ScopeGuard::into_inner(registration);

        Ok(JobHandle {
            job_id,
            events: events_rx,
            completion,
        })
    }

    /// Request cancellation of a running job.
    pub async fn cancel(&self, job_id: &JobId) -> WorkerResult<()> {
        if self.registry.cancel(job_id).await {
            info!(job_id = %job_id, "Cancellation requested");
            Ok(())
        } else {
            Err(WorkerError::job_not_active(job_id))
        }
    }

    /// Stop accepting jobs and cancel every running render.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.slots.close();
        let cancelled = self.registry.cancel_all().await;
        info!("Job executor shutting down, cancelled {} running jobs", cancelled);
    }

    /// Current status of a job.
    ///
    /// Jobs no longer tracked in memory (evicted, or from a previous process)
    /// are reported as succeeded when an artifact record exists.
    pub async fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        if let Some(status) = self.registry.status(job_id).await {
            return Some(status);
        }
        self.artifacts
            .lookup(job_id)
            .await
            .ok()
            .map(|path| JobStatus::recorded(*job_id, path.to_string_lossy()))
    }
}

/// Fail a registered job whose submit never handed it to a responder.
///
/// Runs from a drop guard, so the registry update is spawned; without a
/// runtime (process teardown) there is nobody left to poll the status anyway.
fn abandon_registration(registry: Arc<JobRegistry>, job_id: JobId) {
    warn!(job_id = %job_id, "Submission abandoned before the render started");
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            registry
                .finish_failed(&job_id, FailureReason::Cancelled, None)
                .await;
        });
    }
}
