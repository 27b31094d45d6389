//! Public operation API.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::database::repositories::SettingsRepository;
use crate::operation::{
    CancellationController, DeleteMode, JobSpec, LaunchMode, Operation, ProcessOrchestrator,
    rsync_available,
};
use crate::{Error, Result};

/// Settings key for the configured delete mode.
pub const DELETE_MODE_SETTING: &str = "delete_mode";

/// Entry point for callers outside the core: start, query and cancel jobs.
pub struct OperationService {
    orchestrator: Arc<ProcessOrchestrator>,
    cancellation: CancellationController,
    settings: Arc<dyn SettingsRepository>,
}

impl OperationService {
    pub fn new(orchestrator: Arc<ProcessOrchestrator>, settings: Arc<dyn SettingsRepository>) -> Self {
        Self {
            cancellation: CancellationController::new(orchestrator.clone()),
            orchestrator,
            settings,
        }
    }

    /// Clear `cache_dir` with the configured delete mode.
    pub async fn start_cache_clear(&self, cache_dir: impl Into<PathBuf>) -> String {
        let delete_mode = match self.delete_mode().await {
            Ok(mode) => mode,
            Err(e) => {
                warn!(error = %e, "Failed to read delete mode, using default");
                DeleteMode::default()
            }
        };
        self.start_cache_clear_with(cache_dir, delete_mode).await
    }

    pub async fn start_cache_clear_with(
        &self,
        cache_dir: impl Into<PathBuf>,
        delete_mode: DeleteMode,
    ) -> String {
        let spec = JobSpec::CacheClear {
            cache_dir: cache_dir.into(),
            delete_mode,
            threads: self.orchestrator.workers().clean_threads,
        };
        self.orchestrator.start(spec, LaunchMode::Notify).await
    }

    pub async fn start_log_ingest(&self, log_path: impl Into<PathBuf>, start_line: u64) -> String {
        let spec = JobSpec::LogIngest {
            log_path: log_path.into(),
            start_line,
        };
        self.orchestrator.start(spec, LaunchMode::Notify).await
    }

    pub fn get_operation(&self, id: &str) -> Option<Operation> {
        self.orchestrator.registry().get(id).map(|t| t.snapshot())
    }

    pub fn require_operation(&self, id: &str) -> Result<Operation> {
        self.get_operation(id)
            .ok_or_else(|| Error::not_found("Operation", id))
    }

    /// Every tracked operation, newest first.
    pub fn list_operations(&self) -> Vec<Operation> {
        self.orchestrator.registry().list_all()
    }

    pub fn list_active(&self) -> Vec<Operation> {
        self.list_operations()
            .into_iter()
            .filter(|op| !op.is_terminal())
            .collect()
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.cancellation.request_cancel(id)
    }

    pub async fn force_kill(&self, id: &str) -> bool {
        self.cancellation.force_kill(id).await
    }

    pub async fn delete_mode(&self) -> Result<DeleteMode> {
        match self.settings.get_setting(DELETE_MODE_SETTING).await? {
            Some(raw) => raw.parse(),
            None => Ok(DeleteMode::default()),
        }
    }

    pub async fn set_delete_mode(&self, mode: DeleteMode) -> Result<()> {
        self.settings
            .set_setting(DELETE_MODE_SETTING, mode.as_str())
            .await?;
        info!(mode = mode.as_str(), "Delete mode updated");
        Ok(())
    }

    /// Whether `rsync` is installed, for offering the rsync delete mode.
    pub async fn is_rsync_available(&self) -> bool {
        tokio::task::spawn_blocking(rsync_available)
            .await
            .unwrap_or(false)
    }
}
