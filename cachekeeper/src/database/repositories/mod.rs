//! Repository traits and their SQLite / in-memory implementations.

pub mod operation_state;
pub mod settings;

pub use operation_state::{
    MemoryOperationStateRepository, OperationStateRepository, SqlxOperationStateRepository,
};
pub use settings::{MemorySettingsRepository, SettingsRepository, SqlxSettingsRepository};
