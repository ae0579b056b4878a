// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// This module contains domain-specific aggregates and business logic.
// Each aggregate has its own subdirectory with:
// - Value objects
// - Events
// - Commands
// - Errors
// - Aggregate implementation
// - Command handler
// - Read model projection
//
// This layer only depends on the runtime's public traits.
//
// ============================================================================

pub mod user;
