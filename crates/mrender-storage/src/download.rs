//! Artifact retrieval by job id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File};
use tracing::{debug, warn};

use mrender_models::JobId;

use crate::artifact::ArtifactStore;
use crate::error::{StorageError, StorageResult};

/// An opened artifact ready to be streamed to a caller.
#[derive(Debug)]
pub struct ArtifactDownload {
    pub job_id: JobId,
    pub path: PathBuf,
    pub file: File,
    pub len: u64,
    pub content_type: &'static str,
    pub filename: String,
}

/// Resolves job ids to artifact files.
#[derive(Clone)]
pub struct DownloadService {
    store: Arc<dyn ArtifactStore>,
}

impl DownloadService {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    /// Open the artifact of a succeeded job.
    ///
    /// Ids that are not valid job ids are `NotFound` without any filesystem
    /// access. A record whose file is gone is `ArtifactMissing`.
    pub async fn fetch(&self, job_id: &str) -> StorageResult<ArtifactDownload> {
        let job_id = JobId::parse(job_id).ok_or_else(|| StorageError::not_found(job_id))?;
        let path = self.store.lookup(&job_id).await?;

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(job_id = %job_id, path = %path.display(), "Recorded artifact is missing");
                return Err(StorageError::ArtifactMissing(path));
            }
            Err(e) => return Err(e.into()),
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(StorageError::ArtifactMissing(path));
        }

        debug!(job_id = %job_id, path = %path.display(), bytes = metadata.len(), "Serving artifact");

        Ok(ArtifactDownload {
            job_id,
            content_type: content_type_for(&path),
            filename: filename_for(&path),
            len: metadata.len(),
            file,
            path,
        })
    }

    /// Whether an artifact file currently exists for the job.
    pub async fn is_available(&self, job_id: &JobId) -> bool {
        match self.store.lookup(job_id).await {
            Ok(path) => fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Content type derived from the artifact extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "gif" => "image/gif",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

/// Download filename: the final component of the artifact path.
pub fn filename_for(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{FsArtifactStore, MemoryArtifactStore};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_fetch_recorded_artifact() {
        let dir = TempDir::new().unwrap();
        let video = dir.path().join("MyScene.mp4");
        std::fs::write(&video, b"fake mp4 bytes").unwrap();

        let store = Arc::new(MemoryArtifactStore::new());
        let job_id = JobId::new();
        store.record(&job_id, &video).await.unwrap();

        let service = DownloadService::new(store);
        let mut download = service.fetch(&job_id.to_string()).await.unwrap();

        assert_eq!(download.content_type, "video/mp4");
        assert_eq!(download.filename, "MyScene.mp4");
        assert_eq!(download.len, 14);

        let mut bytes = Vec::new();
        download.file.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"fake mp4 bytes");
    }

    #[tokio::test]
    async fn test_fetch_fabricated_id_has_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let service = DownloadService::new(Arc::new(FsArtifactStore::new(dir.path())));

        let never_issued = JobId::new().to_string();
        for id in ["not-a-job", "../../etc/passwd", never_issued.as_str()] {
            let err = service.fetch(id).await.unwrap_err();
            assert!(matches!(err, StorageError::NotFound(_)), "{}", id);
        }

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_deleted_artifact_is_missing() {
        let store = Arc::new(MemoryArtifactStore::new());
        let job_id = JobId::new();
        store
            .record(&job_id, Path::new("/nonexistent/mrender/Gone.mp4"))
            .await
            .unwrap();

        let service = DownloadService::new(store);
        let err = service.fetch(&job_id.to_string()).await.unwrap_err();
        assert!(matches!(err, StorageError::ArtifactMissing(_)));
        assert!(err.is_unavailable());
        assert!(!service.is_available(&job_id).await);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("/a/B.MP4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("/a/B.gif")), "image/gif");
        assert_eq!(content_type_for(Path::new("/a/B")), "application/octet-stream");
    }
}
