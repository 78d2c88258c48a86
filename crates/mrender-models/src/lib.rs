//! Shared data models for the mrender backend.
//!
//! This crate provides Serde-serializable types for:
//! - Render jobs and their lifecycle states
//! - Job status snapshots for polling
//! - Render events streamed to callers (log lines and terminal outcomes)

pub mod event;
pub mod job;
pub mod job_status;

// Re-export common types
pub use event::{FailureReason, RenderEvent, DONE_SENTINEL, ERROR_SENTINEL};
pub use job::{download_path, InvalidTransition, Job, JobId, JobState};
pub use job_status::JobStatus;
