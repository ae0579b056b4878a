// ============================================================================
// Event Sourcing Store - Generic Persistence Layer
// ============================================================================
//
// The `Store` contract plus the in-memory backend. Database-backed stores
// live outside this crate and implement the same trait.
//
// ============================================================================

pub mod event_store;
pub mod memory;

pub use event_store::{validate_batch, EventFilter, Store, StoreError, StoreQuery};
pub use memory::MemoryStore;
