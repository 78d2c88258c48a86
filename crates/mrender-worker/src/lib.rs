//! Render job execution.
//!
//! This crate provides:
//! - A bounded job pool with admission control and cancellation
//! - The streaming responder that forwards engine output and decides the outcome
//! - An in-memory job registry for status queries

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod responder;

pub use config::{SuccessPolicy, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use executor::{JobExecutor, JobHandle};
pub use logging::JobLogger;
pub use registry::{JobRegistry, DEFAULT_MAX_FINISHED_JOBS};
pub use responder::{decide_outcome, JobOutcome, ResponderSettings, StreamingResponder};
