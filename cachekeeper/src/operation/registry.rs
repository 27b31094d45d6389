//! Concurrent registry of tracked operations.
//!
//! The map only guards entry presence. Each entry carries its own mutex so
//! the poll loop and the exit-wait path of a job serialize their writes.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::model::{Operation, OperationKind, OperationProgress, OperationStatus};

/// Live handle to a spawned worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// OS process id; also the process-group id of the worker tree.
    pub pid: u32,
    /// Fired to make the exit-wait path kill the worker tree.
    pub kill: CancellationToken,
}

#[derive(Debug)]
struct Slot {
    operation: Operation,
    worker: Option<WorkerHandle>,
}

/// An operation plus its in-memory-only handles.
#[derive(Debug)]
pub struct TrackedOperation {
    id: String,
    slot: Mutex<Slot>,
    cancel: CancellationToken,
}

/// Outcome requested for a terminal transition.
#[derive(Debug, Clone)]
pub struct Termination {
    pub status: OperationStatus,
    pub message: String,
    pub error: Option<String>,
    pub progress: Option<OperationProgress>,
}

impl Termination {
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Completed,
            message: message.into(),
            error: None,
            progress: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: OperationStatus::Failed,
            message: format!("Failed: {error}"),
            error: Some(error),
            progress: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Cancelled,
            message: message.into(),
            error: None,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: OperationProgress) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl TrackedOperation {
    fn new(operation: Operation) -> Self {
        Self {
            id: operation.id.clone(),
            slot: Mutex::new(Slot {
                operation,
                worker: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A consistent copy of the current record.
    pub fn snapshot(&self) -> Operation {
        self.slot.lock().operation.clone()
    }

    pub fn status(&self) -> OperationStatus {
        self.slot.lock().operation.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Attach the spawned worker and move to `Running`.
    pub fn mark_running(&self, worker: WorkerHandle, message: &str) -> crate::Result<Operation> {
        let mut slot = self.slot.lock();
        slot.operation.transition(OperationStatus::Running)?;
        slot.operation.status_message = Some(message.to_string());
        slot.worker = Some(worker);
        Ok(slot.operation.clone())
    }

    /// Apply worker counters; `None` once the operation is terminal.
    pub fn apply_progress(
        &self,
        update: &OperationProgress,
        message: Option<&str>,
    ) -> Option<Operation> {
        let mut slot = self.slot.lock();
        slot.operation
            .apply_progress(update, message)
            .then(|| slot.operation.clone())
    }

    /// Perform a terminal transition.
    ///
    /// Returns the finished record only for the caller that actually made
    /// the transition; later callers get `None`. This is what guarantees a
    /// single completion event per operation.
    pub fn finish(&self, termination: Termination) -> Option<Operation> {
        let mut slot = self.slot.lock();
        if slot.operation.is_terminal() {
            return None;
        }

        if let Some(progress) = &termination.progress {
            slot.operation.apply_progress(progress, None);
        }

        // Preparing can only fail; anything else means the worker never ran.
        let Termination {
            mut status,
            mut message,
            mut error,
            ..
        } = termination;
        if slot.operation.status == OperationStatus::Preparing
            && status != OperationStatus::Failed
        {
            error = error.or_else(|| Some(message.clone()));
            message = format!("Failed: {message}");
            status = OperationStatus::Failed;
        }

        slot.operation.transition(status).ok()?;
        slot.operation.status_message = Some(message);
        slot.operation.error = error;
        Some(slot.operation.clone())
    }

    pub fn worker(&self) -> Option<WorkerHandle> {
        self.slot.lock().worker.clone()
    }

    pub fn clear_worker(&self) -> Option<WorkerHandle> {
        self.slot.lock().worker.take()
    }

    pub fn has_worker(&self) -> bool {
        self.slot.lock().worker.is_some()
    }
}

/// Registry of in-memory operations keyed by id.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: DashMap<String, Arc<TrackedOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh `Preparing` operation.
    pub fn create(&self, kind: OperationKind, silent: bool) -> Arc<TrackedOperation> {
        let mut operation = Operation::new(kind);
        operation.silent = silent;
        let tracked = Arc::new(TrackedOperation::new(operation));
        self.operations
            .insert(tracked.id().to_string(), tracked.clone());
        tracked
    }

    /// Insert an existing record, e.g. one reloaded from the state store.
    ///
    /// Returns `None` and leaves the registry untouched when the id is
    /// already tracked.
    pub fn insert(&self, operation: Operation) -> Option<Arc<TrackedOperation>> {
        match self.operations.entry(operation.id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let tracked = Arc::new(TrackedOperation::new(operation));
                slot.insert(tracked.clone());
                Some(tracked)
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TrackedOperation>> {
        self.operations.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshots of every operation, newest first.
    pub fn list_all(&self) -> Vec<Operation> {
        let mut all: Vec<Operation> = self
            .operations
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all
    }

    /// Handles to every tracked operation.
    pub fn tracked(&self) -> Vec<Arc<TrackedOperation>> {
        self.operations
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<TrackedOperation>> {
        self.operations.remove(id).map(|(_, tracked)| tracked)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Active operations of `kind`, optionally excluding silent ones.
    pub fn active_of_kind(&self, kind: OperationKind, include_silent: bool) -> Vec<Operation> {
        self.operations
            .iter()
            .map(|entry| entry.value().snapshot())
            .filter(|op| op.kind == kind && !op.is_terminal())
            .filter(|op| include_silent || !op.silent)
            .collect()
    }
}
