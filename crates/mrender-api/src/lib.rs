//! Axum HTTP API server for render jobs.
//!
//! This crate provides:
//! - Submit-and-stream endpoints (plain-text sentinels and NDJSON events)
//! - Artifact download, job status and cancellation
//! - Code generation pass-through
//! - Rate limiting, security headers and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use services::{CodeGenerator, GeminiClient};
pub use state::AppState;
