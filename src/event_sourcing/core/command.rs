use std::any::Any;
use std::fmt;

use uuid::Uuid;

// ============================================================================
// Commands - transient requests to change one aggregate
// ============================================================================

/// A request routed through the command registry to exactly one handler.
///
/// Commands are never persisted. Concrete commands are plain structs
/// decoded from a [`Payload`](super::event::Payload) by the registry;
/// handlers get them back with [`downcast_ref`](dyn Command::downcast_ref).
pub trait Command: Any + Send + Sync + fmt::Debug {
    fn command_type(&self) -> &str;

    fn aggregate_type(&self) -> &str;

    fn aggregate_id(&self) -> Uuid;

    /// Policy check for the caller's role within a scope on a resource.
    fn is_authorized(&self, role: &str, scope: &str, resource: &str) -> bool;

    fn as_any(&self) -> &dyn Any;
}

impl dyn Command {
    pub fn downcast_ref<C: Command>(&self) -> Option<&C> {
        self.as_any().downcast_ref::<C>()
    }

    pub fn is<C: Command>(&self) -> bool {
        self.as_any().is::<C>()
    }
}

/// Who is submitting a command, checked against [`Command::is_authorized`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub role: String,
    pub scope: String,
    pub resource: String,
}

impl AccessContext {
    pub fn new(role: impl Into<String>, scope: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            scope: scope.into(),
            resource: resource.into(),
        }
    }

    pub fn permits(&self, command: &dyn Command) -> bool {
        command.is_authorized(&self.role, &self.scope, &self.resource)
    }
}
