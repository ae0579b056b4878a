// ============================================================================
// Projections - read models folded from event streams
// ============================================================================
//
// Projector folds events, Repository stores the result, and the
// ProjectingEventHandler joins them. Replay and refresh wrap a handler to
// close gaps left by the bus.
//
// ============================================================================

mod errors;
mod handler;
mod middleware;
mod projector;
mod repository;

pub use errors::ProjectionError;
pub use handler::{EventHandler, ProjectingEventHandler, Resync};
pub use middleware::{warm_up, RefreshConfig, RefreshMiddleware, ReplayMiddleware};
pub use projector::{Projection, Projector};
pub use repository::{MemoryRepository, Repository};
