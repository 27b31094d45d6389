//! Startup reconciliation of persisted operation snapshots.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::model::OperationStatus;
use super::registry::OperationRegistry;
use crate::Result;
use crate::config::RecoveryConfig;
use crate::database::repositories::OperationStateRepository;

/// Error recorded on operations that were active when the process stopped.
pub const INTERRUPTED_ERROR: &str = "Operation interrupted by application restart";

/// Result of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored: usize,
    pub interrupted: usize,
}

/// Reloads recent snapshots and fails the ones that were still running.
pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    registry: Arc<OperationRegistry>,
    store: Arc<dyn OperationStateRepository>,
}

impl RecoveryCoordinator {
    pub fn new(
        config: RecoveryConfig,
        registry: Arc<OperationRegistry>,
        store: Arc<dyn OperationStateRepository>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
        }
    }

    /// Must run before any new job is accepted.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let snapshots = self.store.load_recent(self.config.window()).await?;
        let mut report = RecoveryReport::default();

        for mut op in snapshots {
            if self.registry.contains(&op.id) {
                warn!(operation_id = %op.id, "Skipping snapshot of an operation already tracked");
                continue;
            }

            if !op.is_terminal() {
                op.status = OperationStatus::Failed;
                op.end_time = Some(Utc::now());
                op.error = Some(INTERRUPTED_ERROR.to_string());
                op.status_message = Some(format!("Failed: {INTERRUPTED_ERROR}"));
                op.progress.active_paths.clear();

                if let Err(e) = self.store.upsert(&op).await {
                    warn!(operation_id = %op.id, error = %e, "Failed to persist interrupted operation");
                }
                report.interrupted += 1;
            }

            if self.registry.insert(op).is_some() {
                report.restored += 1;
            }
        }

        info!(
            restored = report.restored,
            interrupted = report.interrupted,
            "Operation state recovered"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::MemoryOperationStateRepository;
    use crate::operation::{Operation, OperationKind};

    #[tokio::test]
    async fn test_recover_fails_active_operations() {
        let store = Arc::new(MemoryOperationStateRepository::new());
        let registry = Arc::new(OperationRegistry::new());

        let mut running = Operation::new(OperationKind::CacheClear);
        running.transition(OperationStatus::Running).unwrap();
        let mut done = Operation::new(OperationKind::LogIngest);
        done.transition(OperationStatus::Running).unwrap();
        done.transition(OperationStatus::Completed).unwrap();
        store.upsert(&running).await.unwrap();
        store.upsert(&done).await.unwrap();

        let coordinator =
            RecoveryCoordinator::new(RecoveryConfig::default(), registry.clone(), store.clone());
        let report = coordinator.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                restored: 2,
                interrupted: 1
            }
        );

        let recovered = registry.get(&running.id).unwrap().snapshot();
        assert_eq!(recovered.status, OperationStatus::Failed);
        assert_eq!(recovered.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert!(recovered.end_time.is_some());
        assert_eq!(store.get(&running.id).unwrap().status, OperationStatus::Failed);

        let untouched = registry.get(&done.id).unwrap().snapshot();
        assert_eq!(untouched, done);
    }

    #[tokio::test]
    async fn test_recover_leaves_live_operations_alone() {
        let store = Arc::new(MemoryOperationStateRepository::new());
        let registry = Arc::new(OperationRegistry::new());

        let live = registry.create(OperationKind::CacheClear, false);
        let mut snapshot = live.snapshot();
        snapshot.transition(OperationStatus::Running).unwrap();
        store.upsert(&snapshot).await.unwrap();

        let coordinator =
            RecoveryCoordinator::new(RecoveryConfig::default(), registry.clone(), store.clone());
        let report = coordinator.recover().await.unwrap();
        assert_eq!(report, RecoveryReport::default());

        let tracked = registry.get(live.id()).unwrap();
        assert!(Arc::ptr_eq(&tracked, &live));
        assert_eq!(tracked.status(), OperationStatus::Preparing);
        assert_eq!(store.get(live.id()).unwrap().status, OperationStatus::Running);
        assert!(store.get(live.id()).unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_recover_ignores_old_snapshots() {
        let store = Arc::new(MemoryOperationStateRepository::new());
        let registry = Arc::new(OperationRegistry::new());

        let mut old = Operation::new(OperationKind::CacheClear);
        old.start_time = Utc::now() - chrono::Duration::hours(30);
        store.upsert(&old).await.unwrap();

        let coordinator =
            RecoveryCoordinator::new(RecoveryConfig::default(), registry.clone(), store);
        let report = coordinator.recover().await.unwrap();
        assert_eq!(report.restored, 0);
        assert!(registry.is_empty());
    }
}
