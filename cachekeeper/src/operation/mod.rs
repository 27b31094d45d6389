//! Operation tracking and external worker orchestration.

pub mod cancellation;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod recovery;
pub mod registry;
pub mod retention;

pub use cancellation::CancellationController;
pub use model::{
    DeleteMode, JobSpec, Operation, OperationKind, OperationProgress, OperationStatus,
    RUNNING_PERCENT_CAP,
};
pub use orchestrator::{LaunchMode, ProcessOrchestrator, WorkerInvocation, rsync_available};
pub use progress::{ProgressReader, ProgressRecord};
pub use recovery::{INTERRUPTED_ERROR, RecoveryCoordinator, RecoveryReport};
pub use registry::{OperationRegistry, Termination, TrackedOperation, WorkerHandle};
pub use retention::RetentionSweeper;
