//! Live log monitoring and the cooperation primitives it relies on.

pub mod line_counter;
pub mod live;
pub mod pause_gate;
pub mod position;
pub mod probe;

pub use line_counter::LineCounter;
pub use live::{
    IngestOutcome, IngestTrigger, LiveFileMonitor, MonitorState, OrchestratorIngestTrigger,
    TickOutcome,
};
pub use pause_gate::PauseGate;
pub use position::LogPositionStore;
pub use probe::{ActiveOperationProbe, BusyFlag, BusyGuard, BusyProbe};
