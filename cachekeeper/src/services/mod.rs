//! Service layer: the public operation API and the container that wires it.

pub mod container;
pub mod operations;

pub use container::ServiceContainer;
pub use operations::{DELETE_MODE_SETTING, OperationService};
