//! Artifact records: job id -> rendered file path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use mrender_models::JobId;

use crate::error::{StorageError, StorageResult};

/// Fixed name of the record file inside a job workspace.
pub const RECORD_FILENAME: &str = "output.txt";

/// Durable mapping from job id to artifact path.
///
/// A record exists if and only if the job's render succeeded.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist the artifact path of a succeeded job.
    async fn record(&self, job_id: &JobId, artifact_path: &Path) -> StorageResult<()>;

    /// Look up the artifact path; `NotFound` if nothing was recorded.
    async fn lookup(&self, job_id: &JobId) -> StorageResult<PathBuf>;
}

/// Records stored as `output.txt` inside each job workspace.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.to_string()).join(RECORD_FILENAME)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn record(&self, job_id: &JobId, artifact_path: &Path) -> StorageResult<()> {
        let record = self.record_path(job_id);
        let tmp = record.with_extension("tmp");

        // Write then rename so readers never observe a half-written record.
        fs::write(&tmp, artifact_path.to_string_lossy().as_bytes())
            .await
            .map_err(|e| StorageError::record_failed(job_id.to_string(), e))?;
        if let Err(e) = fs::rename(&tmp, &record).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::record_failed(job_id.to_string(), e));
        }

        debug!(job_id = %job_id, artifact = %artifact_path.display(), "Artifact recorded");
        Ok(())
    }

    async fn lookup(&self, job_id: &JobId) -> StorageResult<PathBuf> {
        let contents = match fs::read_to_string(self.record_path(job_id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(job_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let path = contents.trim();
        if path.is_empty() {
            return Err(StorageError::not_found(job_id.to_string()));
        }
        Ok(PathBuf::from(path))
    }
}

/// In-process records, for tests and single-run tools.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    records: RwLock<HashMap<JobId, PathBuf>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded artifacts.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn record(&self, job_id: &JobId, artifact_path: &Path) -> StorageResult<()> {
        self.records
            .write()
            .await
            .insert(*job_id, artifact_path.to_path_buf());
        Ok(())
    }

    async fn lookup(&self, job_id: &JobId) -> StorageResult<PathBuf> {
        self.records
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(job_id.to_string()))
    }
}
