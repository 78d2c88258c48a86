//! Per-job workspace directories.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use mrender_models::{Job, JobId};

use crate::error::{StorageError, StorageResult};

/// Fixed name of the source file inside every workspace.
pub const SOURCE_FILENAME: &str = "input.py";

/// Allocates one directory per job under an injected artifacts root.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    /// Open (and create if missing) the artifacts root.
    ///
    /// The root is canonicalized so source paths handed to the engine stay
    /// valid from inside the workspace.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .await
            .map_err(|e| StorageError::workspace_creation(root, e))?;
        let root = fs::canonicalize(root)
            .await
            .map_err(|e| StorageError::workspace_creation(root, e))?;

        Ok(Self { root })
    }

    /// Artifacts root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Workspace directory of a job (whether or not it exists).
    pub fn workspace_path(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Create a job: allocate its workspace and write the source file.
    pub async fn create_job(&self, entry_point: &str, source_code: &str) -> StorageResult<Job> {
        let id = JobId::new();
        let workspace = self.workspace_path(&id);

        // create_dir (not create_dir_all) fails if the directory exists, so two
        // jobs can never end up sharing one.
        fs::create_dir(&workspace)
            .await
            .map_err(|e| StorageError::workspace_creation(&workspace, e))?;

        let source_path = workspace.join(SOURCE_FILENAME);
        if let Err(e) = fs::write(&source_path, source_code).await {
            if let Err(cleanup) = fs::remove_dir_all(&workspace).await {
                warn!(
                    "Failed to remove workspace {} after write error: {}",
                    workspace.display(),
                    cleanup
                );
            }
            return Err(StorageError::workspace_creation(&source_path, e));
        }

        debug!(job_id = %id, workspace = %workspace.display(), "Workspace created");

        Ok(Job::new(id, entry_point, source_code, workspace, source_path))
    }
}

/// Resolve an artifact path reported by the engine against the job workspace.
pub fn resolve_artifact_path(workspace: &Path, reported: &Path) -> PathBuf {
    if reported.is_absolute() {
        reported.to_path_buf()
    } else {
        workspace.join(reported)
    }
}
