// ============================================================================
// Command Registry & Dispatch
// ============================================================================
//
// Maps command-type identifiers to decoders and handlers. The registry is
// constructed once by the composition root and passed by reference; there
// is no process-wide default instance.
//
// ============================================================================

mod registry;

pub use registry::{CommandHandler, CommandRegistry, RegistryError};
