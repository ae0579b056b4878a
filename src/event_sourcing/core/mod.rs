// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// Value types every other component works with: type names, the payload
// envelope, events, aggregates and commands. No storage or transport code
// lives here.
//
// ============================================================================

pub mod aggregate;
pub mod command;
pub mod event;
pub mod ids;

pub use aggregate::{Aggregate, AggregateError, AggregateRoot};
pub use command::{AccessContext, Command};
pub use event::{DomainEvent, Event, Payload, PayloadError};
pub use ids::{AggregateType, CommandType, EventType, ModelError};
