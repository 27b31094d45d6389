//! Cooperative cancel and synchronous force-kill.

use std::sync::Arc;

use tracing::{info, warn};

use super::orchestrator::ProcessOrchestrator;
use super::registry::Termination;

/// Requests cancellation of running operations.
pub struct CancellationController {
    orchestrator: Arc<ProcessOrchestrator>,
}

impl CancellationController {
    pub fn new(orchestrator: Arc<ProcessOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Raise the cancel signal; the poll loop reacts within one interval.
    ///
    /// Returns `false` for unknown or already finished operations.
    pub fn request_cancel(&self, id: &str) -> bool {
        let Some(tracked) = self.orchestrator.registry().get(id) else {
            return false;
        };
        if tracked.is_terminal() {
            return false;
        }

        tracked.cancel_token().cancel();
        info!(operation_id = %id, "Cancellation requested");
        true
    }

    /// Mark the operation cancelled and kill the worker tree before returning.
    ///
    /// The exit-wait path still reaps the process, but the record is final
    /// once this returns.
    pub async fn force_kill(&self, id: &str) -> bool {
        let Some(tracked) = self.orchestrator.registry().get(id) else {
            return false;
        };
        if tracked.is_terminal() {
            return false;
        }

        // Record the outcome first so the worker's exit is read as a cancellation.
        let finished = tracked.finish(Termination::cancelled("Operation force killed"));
        tracked.cancel_token().cancel();
        if let Some(worker) = tracked.clear_worker() {
            if let Err(e) = process_utils::kill_process_tree(worker.pid) {
                warn!(operation_id = %id, pid = worker.pid, error = %e, "Failed to kill worker tree");
            }
            worker.kill.cancel();
        }

        match finished {
            Some(op) => {
                info!(operation_id = %id, "Operation force killed");
                self.orchestrator.announce_terminal(&op).await;
                true
            }
            // Another path finished it between our checks.
            None => false,
        }
    }
}
