//! Shared fixtures: shell-script workers and an in-memory orchestrator.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cachekeeper::config::{OrchestratorConfig, WorkerConfig};
use cachekeeper::database::repositories::MemoryOperationStateRepository;
use cachekeeper::notification::{BroadcastNotifier, OperationEvent};
use cachekeeper::operation::{Operation, OperationRegistry, ProcessOrchestrator};
use tokio::sync::broadcast;

/// Shell prelude giving scripts a `progress '<json>'` helper that writes
/// the progress file atomically.
const PRELUDE: &str = r#"#!/bin/sh
progress() {
    printf '%s' "$1" > "$PROGRESS.tmp" && mv "$PROGRESS.tmp" "$PROGRESS"
}
"#;

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub orchestrator: Arc<ProcessOrchestrator>,
    pub store: Arc<MemoryOperationStateRepository>,
    pub notifier: Arc<BroadcastNotifier>,
}

impl Harness {
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        self.orchestrator.registry()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// A cache directory with one `00` sub-directory.
    pub fn cache_dir(&self) -> PathBuf {
        let cache = self.path("cache");
        std::fs::create_dir_all(cache.join("00")).unwrap();
        cache
    }

    pub fn snapshot(&self, id: &str) -> Operation {
        self.registry().get(id).unwrap().snapshot()
    }

    pub async fn wait_for(&self, id: &str, pred: impl Fn(&Operation) -> bool) -> Operation {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let op = self.snapshot(id);
            if pred(&op) {
                return op;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting on operation {id}: {op:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_terminal(&self, id: &str) -> Operation {
        self.wait_for(id, |op| op.is_terminal()).await
    }
}

/// Write an executable worker script. `progress_arg` is the 1-based argument
/// position of the progress file path.
pub fn write_worker(dir: &Path, name: &str, progress_arg: usize, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!("{PRELUDE}PROGRESS=\"${progress_arg}\"\n{body}\n");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn cache_worker(dir: &Path, body: &str) -> PathBuf {
    write_worker(dir, "cache_cleaner.sh", 2, body)
}

pub fn ingest_worker(dir: &Path, body: &str) -> PathBuf {
    write_worker(dir, "log_processor.sh", 3, body)
}

pub fn harness(configure: impl FnOnce(&Path, WorkerConfig) -> WorkerConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let workers = configure(
        dir.path(),
        WorkerConfig::default()
            .with_progress_dir(dir.path().join("progress"))
            .with_ingest_db_path(dir.path().join("ingest.db"))
            .with_cache_clean_bin(dir.path().join("missing-cache-worker"))
            .with_log_ingest_bin(dir.path().join("missing-ingest-worker")),
    );

    let store = Arc::new(MemoryOperationStateRepository::new());
    let notifier = Arc::new(BroadcastNotifier::new());
    let orchestrator = Arc::new(ProcessOrchestrator::new(
        OrchestratorConfig::default()
            .with_poll_interval_ms(50)
            .with_snapshot_every(2),
        workers,
        Arc::new(OperationRegistry::new()),
        store.clone(),
        notifier.clone(),
    ));

    Harness {
        dir,
        orchestrator,
        store,
        notifier,
    }
}

/// Drain every event currently buffered for `id`.
pub fn drain_events(rx: &mut broadcast::Receiver<OperationEvent>, id: &str) -> Vec<OperationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.operation_id() == id {
            events.push(event);
        }
    }
    events
}

pub fn completions(events: &[OperationEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, OperationEvent::Complete(_)))
        .count()
}
