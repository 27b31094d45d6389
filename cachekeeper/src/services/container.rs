//! Service container wiring the core together.
//!
//! Owns the shared registry, stores and notifier, and the lifecycle of the
//! background loops (retention sweep, live monitor).

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::operations::OperationService;
use crate::config::AppConfig;
use crate::database::DbPool;
use crate::database::repositories::{
    OperationStateRepository, SettingsRepository, SqlxOperationStateRepository,
    SqlxSettingsRepository,
};
use crate::monitor::{
    ActiveOperationProbe, BusyFlag, LiveFileMonitor, LogPositionStore, OrchestratorIngestTrigger,
    PauseGate,
};
use crate::notification::BroadcastNotifier;
use crate::operation::{
    OperationKind, OperationRegistry, ProcessOrchestrator, RecoveryCoordinator, RecoveryReport,
    RetentionSweeper,
};
use crate::{Error, Result};

/// Default shutdown timeout for background loops.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Service container holding all application services.
pub struct ServiceContainer {
    config: AppConfig,
    pool: Option<DbPool>,
    registry: Arc<OperationRegistry>,
    store: Arc<dyn OperationStateRepository>,
    settings: Arc<dyn SettingsRepository>,
    notifier: Arc<BroadcastNotifier>,
    orchestrator: Arc<ProcessOrchestrator>,
    /// Built by [`ServiceContainer::initialize`] once recovery has run.
    operations: OnceLock<Arc<OperationService>>,
    pause_gate: Arc<PauseGate>,
    /// Held by the log-removal service while it rewrites the log.
    log_removal: BusyFlag,
    live_monitor_busy: BusyFlag,
    live_monitor: Mutex<Option<LiveFileMonitor>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Container backed by the SQLite pool.
    pub fn from_pool(config: AppConfig, pool: DbPool) -> Self {
        let store = Arc::new(SqlxOperationStateRepository::new(pool.clone()));
        let settings = Arc::new(SqlxSettingsRepository::new(pool.clone()));
        let mut container = Self::new(config, store, settings);
        container.pool = Some(pool);
        container
    }

    pub fn new(
        config: AppConfig,
        store: Arc<dyn OperationStateRepository>,
        settings: Arc<dyn SettingsRepository>,
    ) -> Self {
        info!("Initializing service container");

        let registry = Arc::new(OperationRegistry::new());
        let notifier = Arc::new(BroadcastNotifier::new());
        let orchestrator = Arc::new(ProcessOrchestrator::new(
            config.orchestrator.clone(),
            config.workers.clone(),
            registry.clone(),
            store.clone(),
            notifier.clone(),
        ));
        let pause_gate = Arc::new(PauseGate::new());
        let log_removal = BusyFlag::new("log-removal");
        let live_monitor = LiveFileMonitor::new(
            config.live_monitor.clone(),
            pause_gate.clone(),
            LogPositionStore::new(settings.clone(), &config.live_monitor.datasource),
            Arc::new(OrchestratorIngestTrigger::new(orchestrator.clone())),
        )
        .with_probe(Arc::new(ActiveOperationProbe::new(
            "manual-ingest",
            OperationKind::LogIngest,
            registry.clone(),
        )))
        .with_probe(Arc::new(log_removal.clone()));
        let live_monitor_busy = live_monitor.busy_flag();

        Self {
            config,
            pool: None,
            registry,
            store,
            settings,
            notifier,
            orchestrator,
            operations: OnceLock::new(),
            pause_gate,
            log_removal,
            live_monitor_busy,
            live_monitor: Mutex::new(Some(live_monitor)),
            background: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Recover persisted state, then start the background loops.
    ///
    /// The operation service is only handed out after recovery, so no job
    /// can exist yet when persisted snapshots are reconciled.
    pub async fn initialize(&self) -> Result<RecoveryReport> {
        info!("Initializing services");
        if self.operations.get().is_some() {
            warn!("Services already initialized");
            return Ok(RecoveryReport::default());
        }

        let report = RecoveryCoordinator::new(
            self.config.recovery.clone(),
            self.registry.clone(),
            self.store.clone(),
        )
        .recover()
        .await?;

        let operations = Arc::new(OperationService::new(
            self.orchestrator.clone(),
            self.settings.clone(),
        ));
        if self.operations.set(operations).is_err() {
            warn!("Services already initialized");
            return Ok(report);
        }

        let sweeper = Arc::new(RetentionSweeper::new(
            self.config.retention.clone(),
            self.registry.clone(),
            self.store.clone(),
        ))
        .start_background_task(self.cancellation_token.child_token());
        self.background.lock().push(sweeper);

        let monitor = self.live_monitor.lock().take();
        match monitor {
            Some(monitor) if self.config.live_monitor.enabled => {
                let handle = monitor.start_background_task(self.cancellation_token.child_token());
                self.background.lock().push(handle);
            }
            Some(_) => info!("Live log monitor disabled"),
            None => warn!("Services already initialized"),
        }

        info!("Services initialized");
        Ok(report)
    }

    /// Stop background loops and write every in-memory operation to the store.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        let handles: Vec<_> = self.background.lock().drain(..).collect();
        let joined = tokio::time::timeout(timeout, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;
        if joined.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        let snapshots = self.registry.list_all();
        self.store.replace_all(&snapshots).await?;
        info!(count = snapshots.len(), "Operation state saved");

        if let Some(pool) = &self.pool {
            info!("Closing database pool...");
            pool.close().await;
        }

        info!("Services shut down");
        Ok(())
    }

    /// Fails with [`Error::NotInitialized`] until `initialize` has run.
    pub fn operations(&self) -> Result<&Arc<OperationService>> {
        self.operations.get().ok_or(Error::NotInitialized)
    }

    pub fn notifier(&self) -> &Arc<BroadcastNotifier> {
        &self.notifier
    }

    pub fn settings(&self) -> &Arc<dyn SettingsRepository> {
        &self.settings
    }

    pub fn pause_gate(&self) -> &Arc<PauseGate> {
        &self.pause_gate
    }

    pub fn log_removal_flag(&self) -> &BusyFlag {
        &self.log_removal
    }

    pub fn live_monitor_flag(&self) -> &BusyFlag {
        &self.live_monitor_busy
    }

    pub fn log_path(&self) -> &Path {
        &self.config.live_monitor.log_path
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
