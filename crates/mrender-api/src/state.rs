//! Application state.

use std::sync::Arc;

use tracing::info;

use mrender_storage::DownloadService;
use mrender_worker::{JobExecutor, WorkerConfig};

use crate::config::ApiConfig;
use crate::services::{CodeGenerator, GeminiClient};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub executor: Arc<JobExecutor>,
    pub downloads: DownloadService,
    /// None when no generation backend is configured
    pub codegen: Option<Arc<dyn CodeGenerator>>,
}

impl AppState {
    /// Create new application state.
    pub async fn new(
        config: ApiConfig,
        worker_config: WorkerConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let executor = JobExecutor::from_config(worker_config).await?;

        let codegen = GeminiClient::from_env().map(|client| {
            info!("Code generation enabled with models {:?}", client.models());
            Arc::new(client) as Arc<dyn CodeGenerator>
        });

        Ok(Self::from_parts(config, Arc::new(executor), codegen))
    }

    /// Assemble state from already-built parts.
    pub fn from_parts(
        config: ApiConfig,
        executor: Arc<JobExecutor>,
        codegen: Option<Arc<dyn CodeGenerator>>,
    ) -> Self {
        let downloads = DownloadService::new(executor.artifacts());
        Self {
            config,
            executor,
            downloads,
            codegen,
        }
    }
}
