//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use mrender_engine::{Quality, RenderCommand, Renderer};
use mrender_models::Job;

/// When a finished render counts as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessPolicy {
    /// The artifact marker alone decides; the exit code is only reported.
    #[default]
    MarkerOnly,
    /// The marker must be seen and the engine must exit with code 0.
    MarkerAndZeroExit,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root directory holding one workspace per job
    pub artifacts_dir: PathBuf,
    /// Render engine executable
    pub engine_program: String,
    /// Arguments placed before the render flags
    pub engine_args: Vec<String>,
    /// Renderer backend
    pub renderer: Renderer,
    /// Quality preset
    pub quality: Quality,
    /// Maximum renders running at once
    pub max_concurrent_jobs: usize,
    /// Maximum accepted jobs waiting for a render slot
    pub max_queued_jobs: usize,
    /// Render deadline (None = unbounded)
    pub render_timeout: Option<Duration>,
    /// Success policy
    pub success_policy: SuccessPolicy,
    /// Time between SIGTERM and kill when stopping a render
    pub terminate_grace: Duration,
    /// Events buffered per job before the engine output is back-pressured
    pub event_buffer: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from("/app/artifacts"),
            engine_program: "manim".to_string(),
            engine_args: Vec::new(),
            renderer: Renderer::Cairo,
            quality: Quality::Low,
            max_concurrent_jobs: 2,
            max_queued_jobs: 8,
            render_timeout: None,
            success_policy: SuccessPolicy::MarkerOnly,
            terminate_grace: Duration::from_secs(5),
            event_buffer: 64,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            engine_program: std::env::var("RENDER_ENGINE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.engine_program),
            engine_args: std::env::var("RENDER_ENGINE_ARGS")
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            renderer: parse_or_default("RENDER_RENDERER", defaults.renderer),
            quality: parse_or_default("RENDER_QUALITY", defaults.quality),
            max_concurrent_jobs: std::env::var("RENDER_MAX_CONCURRENT_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
            max_queued_jobs: std::env::var("RENDER_MAX_QUEUED_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_queued_jobs),
            render_timeout: std::env::var("RENDER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            success_policy: if env_flag("RENDER_REQUIRE_ZERO_EXIT") {
                SuccessPolicy::MarkerAndZeroExit
            } else {
                SuccessPolicy::MarkerOnly
            },
            terminate_grace: Duration::from_secs(
                std::env::var("RENDER_TERMINATE_GRACE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            event_buffer: std::env::var("RENDER_EVENT_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.event_buffer),
        }
    }

    /// Jobs admitted at once, running or waiting.
    pub fn admission_limit(&self) -> usize {
        self.max_concurrent_jobs + self.max_queued_jobs
    }

    /// Engine invocation for a job.
    pub fn render_command(&self, job: &Job) -> RenderCommand {
        RenderCommand::new(&self.engine_program, &job.source_path, &job.entry_point)
            .leading_args(self.engine_args.iter().cloned())
            .renderer(self.renderer)
            .quality(self.quality)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr<Err = String>,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("Ignoring {}: {}", key, e);
            default
        }),
        Err(_) => default,
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
