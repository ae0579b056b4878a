// ============================================================================
// User Domain - reference aggregate wired through the whole runtime
// ============================================================================
//
// This module contains ALL User-specific code:
// - Value objects (Email, UserStatus)
// - Events (UserCreated, UserEmailChanged, UserDeactivated)
// - Commands (CreateUser, ChangeUserEmail, DeactivateUser)
// - Errors (UserError enum)
// - Aggregate (UserAggregate with business rules)
// - Command Handler (UserCommandHandler, registry wiring)
// - Projection (UserView read model and its projector)
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod commands;
pub mod errors;
pub mod aggregate;
pub mod command_handler;
pub mod projection;

pub use value_objects::*;
pub use events::*;
pub use commands::*;
pub use errors::*;
pub use aggregate::*;
pub use command_handler::*;
pub use projection::*;
