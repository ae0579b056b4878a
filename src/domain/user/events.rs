use serde::{Deserialize, Serialize};

use super::value_objects::Email;
use crate::event_sourcing::DomainEvent;

// ============================================================================
// User Domain Events
// ============================================================================

/// Union type for all user events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UserEvent {
    Created(UserCreated),
    EmailChanged(UserEmailChanged),
    Deactivated(UserDeactivated),
}

impl DomainEvent for UserEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UserEvent::Created(_) => USER_CREATED,
            UserEvent::EmailChanged(_) => USER_EMAIL_CHANGED,
            UserEvent::Deactivated(_) => USER_DEACTIVATED,
        }
    }
}

pub const USER_CREATED: &str = "UserCreated";
pub const USER_EMAIL_CHANGED: &str = "UserEmailChanged";
pub const USER_DEACTIVATED: &str = "UserDeactivated";

// Individual event types

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCreated {
    pub email: Email,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEmailChanged {
    pub old_email: Email,
    pub new_email: Email,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDeactivated {
    pub reason: String,
}
