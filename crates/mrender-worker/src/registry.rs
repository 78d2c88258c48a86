//! In-memory job registry.
//!
//! Holds a status snapshot per job plus the cancel handle of running jobs.
//! Finished entries are kept for status queries and evicted oldest first.

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::{watch, RwLock};
use tracing::warn;

use mrender_models::{FailureReason, InvalidTransition, Job, JobId, JobStatus};

/// Finished jobs retained for status queries.
pub const DEFAULT_MAX_FINISHED_JOBS: usize = 10_000;

struct Entry {
    status: JobStatus,
    cancel: Option<watch::Sender<bool>>,
}

pub struct JobRegistry {
    entries: RwLock<HashMap<JobId, Entry>>,
    max_finished: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FINISHED_JOBS)
    }
}

impl JobRegistry {
    pub fn new(max_finished: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_finished,
        }
    }

    /// Track a freshly created job.
    pub async fn register(&self, job: &Job) {
        self.entries.write().await.insert(
            job.id,
            Entry {
                status: JobStatus::for_job(job),
                cancel: None,
            },
        );
    }

    /// Mark a job as running and keep its cancel handle.
    pub async fn start(&self, job_id: &JobId, cancel: watch::Sender<bool>) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(job_id) {
            if let Err(e) = entry.status.start() {
                warn!(job_id = %job_id, "Ignoring start: {}", e);
                return;
            }
            entry.cancel = Some(cancel);
        }
    }

    pub async fn add_lines(&self, job_id: &JobId, count: u64) {
        if let Some(entry) = self.entries.write().await.get_mut(job_id) {
            entry.status.add_lines(count);
        }
    }

    pub async fn finish_succeeded(&self, job_id: &JobId, artifact: &Path, exit_code: Option<i32>) {
        self.finish(job_id, |status| {
            status.succeed(artifact.to_string_lossy(), exit_code)
        })
        .await;
    }

    pub async fn finish_failed(&self, job_id: &JobId, reason: FailureReason, exit_code: Option<i32>) {
        self.finish(job_id, |status| status.fail(reason, exit_code))
            .await;
    }

    async fn finish<F>(&self, job_id: &JobId, apply: F)
    where
        F: FnOnce(&mut JobStatus) -> Result<(), InvalidTransition>,
    {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(job_id) {
            if let Err(e) = apply(&mut entry.status) {
                warn!(job_id = %job_id, "Ignoring terminal update: {}", e);
            }
            entry.cancel = None;
        }
        self.evict_finished(&mut entries);
    }

    fn evict_finished(&self, entries: &mut HashMap<JobId, Entry>) {
        let mut finished: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.status.is_terminal())
            .map(|(id, e)| (e.status.updated_at, *id))
            .collect();
        if finished.len() <= self.max_finished {
            return;
        }

        finished.sort_unstable_by_key(|(updated_at, _)| *updated_at);
        let excess = finished.len() - self.max_finished;
        for (_, id) in finished.into_iter().take(excess) {
            entries.remove(&id);
        }
    }

    pub async fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.entries
            .read()
            .await
            .get(job_id)
            .map(|e| e.status.clone())
    }

    /// Request cancellation of a running job; false if it is not running.
    pub async fn cancel(&self, job_id: &JobId) -> bool {
        let entries = self.entries.read().await;
        match entries.get(job_id).and_then(|e| e.cancel.as_ref()) {
            Some(cancel) => {
                cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Request cancellation of every running job. Returns how many were signalled.
    pub async fn cancel_all(&self) -> usize {
        let entries = self.entries.read().await;
        let mut signalled = 0;
        for cancel in entries.values().filter_map(|e| e.cancel.as_ref()) {
            cancel.send_replace(true);
            signalled += 1;
        }
        signalled
    }

    /// Jobs currently holding a render slot.
    pub async fn running(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.cancel.is_some())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrender_models::JobState;

    fn job() -> Job {
        Job::new(JobId::new(), "MyScene", "code", "/tmp/w", "/tmp/w/input.py")
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let registry = JobRegistry::default();
        let job = job();
        registry.register(&job).await;
        assert_eq!(registry.status(&job.id).await.unwrap().state, JobState::Pending);

        let (tx, mut rx) = watch::channel(false);
        registry.start(&job.id, tx).await;
        registry.add_lines(&job.id, 2).await;
        assert_eq!(registry.running().await, 1);

        assert!(registry.cancel(&job.id).await);
        assert!(*rx.borrow_and_update());

        registry
            .finish_failed(&job.id, FailureReason::Cancelled, Some(143))
            .await;
        let status = registry.status(&job.id).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.failure, Some(FailureReason::Cancelled));
        assert_eq!(status.lines_streamed, 2);
        assert_eq!(registry.running().await, 0);
        assert!(!registry.cancel(&job.id).await);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let registry = JobRegistry::default();
        assert!(!registry.cancel(&JobId::new()).await);
    }

    #[tokio::test]
    async fn test_finished_jobs_are_evicted_oldest_first() {
        let registry = JobRegistry::new(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = job();
            registry.register(&job).await;
            let (tx, _rx) = watch::channel(false);
            registry.start(&job.id, tx).await;
            registry
                .finish_succeeded(&job.id, Path::new("/x/A.mp4"), Some(0))
                .await;
            ids.push(job.id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert_eq!(registry.len().await, 2);
        assert!(registry.status(&ids[0]).await.is_none());
        assert!(registry.status(&ids[2]).await.is_some());
    }

    #[tokio::test]
    async fn test_running_jobs_are_never_evicted() {
        let registry = JobRegistry::new(0);
        let running = job();
        registry.register(&running).await;
        let (tx, _rx) = watch::channel(false);
        registry.start(&running.id, tx).await;

        let done = job();
        registry.register(&done).await;
        registry
            .finish_failed(&done.id, FailureReason::SpawnFailed, None)
            .await;

        assert!(registry.status(&running.id).await.is_some());
        assert!(registry.status(&done.id).await.is_none());
    }
}
