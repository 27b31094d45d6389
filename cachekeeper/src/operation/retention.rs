//! Periodic eviction of finished operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::OperationRegistry;
use crate::Result;
use crate::config::RetentionConfig;
use crate::database::repositories::OperationStateRepository;

/// Evicts terminal operations past the retention window.
pub struct RetentionSweeper {
    config: RetentionConfig,
    registry: Arc<OperationRegistry>,
    store: Arc<dyn OperationStateRepository>,
}

impl RetentionSweeper {
    pub fn new(
        config: RetentionConfig,
        registry: Arc<OperationRegistry>,
        store: Arc<dyn OperationStateRepository>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
        }
    }

    /// Run a single sweep. Returns the number of operations evicted.
    ///
    /// Active operations are never touched regardless of age.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.config.retention();
        let mut evicted = 0;

        for tracked in self.registry.tracked() {
            let op = tracked.snapshot();
            let expired = op.is_terminal() && op.end_time.is_some_and(|end| end < cutoff);
            if !expired {
                continue;
            }

            self.registry.remove(&op.id);
            if let Err(e) = self.store.remove(&op.id).await {
                warn!(operation_id = %op.id, error = %e, "Failed to remove expired snapshot");
            }
            evicted += 1;
        }

        if evicted > 0 {
            info!(
                "Evicted {} finished operations (retention: {}h)",
                evicted, self.config.retention_hours
            );
        } else {
            debug!("No operations to evict");
        }

        Ok(evicted)
    }

    /// Start the background sweep task.
    ///
    /// A sweep in progress runs to completion before the task observes the
    /// cancellation.
    pub fn start_background_task(
        self: Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep_interval =
                interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));

            info!(
                "Retention sweeper started (retention: {}h, interval: {}s)",
                self.config.retention_hours, self.config.sweep_interval_secs
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Retention sweeper shutting down");
                        break;
                    }
                    _ = sweep_interval.tick() => {
                        if let Err(e) = self.run_sweep(Utc::now()).await {
                            error!("Retention sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::MemoryOperationStateRepository;
    use crate::operation::{Operation, OperationKind, OperationStatus};

    fn finished(hours_ago: i64) -> Operation {
        let mut op = Operation::new(OperationKind::CacheClear);
        op.transition(OperationStatus::Running).unwrap();
        op.transition(OperationStatus::Completed).unwrap();
        op.start_time = Utc::now() - chrono::Duration::hours(hours_ago + 1);
        op.end_time = Some(Utc::now() - chrono::Duration::hours(hours_ago));
        op
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_only() {
        let registry = Arc::new(OperationRegistry::new());
        let store = Arc::new(MemoryOperationStateRepository::new());

        let old = finished(25);
        let recent = finished(1);
        let mut active = Operation::new(OperationKind::LogIngest);
        active.transition(OperationStatus::Running).unwrap();
        active.start_time = Utc::now() - chrono::Duration::hours(48);

        for op in [&old, &recent, &active] {
            store.upsert(op).await.unwrap();
            registry.insert(op.clone());
        }

        let sweeper = RetentionSweeper::new(RetentionConfig::default(), registry.clone(), store.clone());
        let evicted = sweeper.run_sweep(Utc::now()).await.unwrap();

        assert_eq!(evicted, 1);
        assert!(registry.get(&old.id).is_none());
        assert!(store.get(&old.id).is_none());
        assert!(registry.get(&recent.id).is_some());
        assert!(registry.get(&active.id).is_some());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_background_task_stops_on_cancel() {
        let registry = Arc::new(OperationRegistry::new());
        let store = Arc::new(MemoryOperationStateRepository::new());
        registry.insert(finished(30));

        let sweeper = Arc::new(RetentionSweeper::new(
            RetentionConfig::default().with_sweep_interval_secs(1),
            registry.clone(),
            store,
        ));
        let token = CancellationToken::new();
        let handle = sweeper.start_background_task(token.clone());

        // The first interval tick fires immediately.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(registry.is_empty());
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
