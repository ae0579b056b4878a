// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// Write side of the runtime: the data model, the store contract and the
// manager that ties command execution to persistence and publishing.
// Domain-specific code is in src/domain/
//
// ============================================================================

mod core;
mod manager;
mod store;

pub use self::core::*;
pub use self::manager::{AggregateManager, ManagerConfig, ManagerError};
pub use self::store::*;
