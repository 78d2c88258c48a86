//! Filesystem storage for render jobs.
//!
//! This crate provides:
//! - Per-job workspace allocation under an injected artifacts root
//! - Artifact records (filesystem and in-memory implementations)
//! - Artifact retrieval by job id with content metadata

pub mod artifact;
pub mod download;
pub mod error;
pub mod workspace;

pub use artifact::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, RECORD_FILENAME};
pub use download::{content_type_for, filename_for, ArtifactDownload, DownloadService};
pub use error::{StorageError, StorageResult};
pub use workspace::{resolve_artifact_path, WorkspaceStore, SOURCE_FILENAME};
