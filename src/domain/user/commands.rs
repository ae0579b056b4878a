use std::any::Any;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::UserError;
use crate::event_sourcing::Command;

// ============================================================================
// User Domain Commands
// ============================================================================
//
// The structs below are what the command registry decodes from payloads.
// The handler folds each of them into `UserCommand`, the single command
// type the aggregate understands.
//
// ============================================================================

pub const USER_AGGREGATE: &str = "User";

#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Create { email: String, name: String },
    ChangeEmail { email: String },
    Deactivate { reason: String },
}

impl UserCommand {
    /// Extract the aggregate id and the aggregate-level command from a
    /// decoded registry command.
    pub fn from_command(command: &dyn Command) -> Result<(Uuid, Self), UserError> {
        if let Some(c) = command.as_any().downcast_ref::<CreateUser>() {
            return Ok((
                c.user_id,
                UserCommand::Create {
                    email: c.email.clone(),
                    name: c.name.clone(),
                },
            ));
        }
        if let Some(c) = command.as_any().downcast_ref::<ChangeUserEmail>() {
            return Ok((c.user_id, UserCommand::ChangeEmail { email: c.email.clone() }));
        }
        if let Some(c) = command.as_any().downcast_ref::<DeactivateUser>() {
            return Ok((c.user_id, UserCommand::Deactivate { reason: c.reason.clone() }));
        }
        Err(UserError::UnsupportedCommand(command.command_type().to_string()))
    }
}

/// Admins may touch any user; a plain user only their own record.
fn authorized_for(user_id: Uuid, role: &str, resource: &str) -> bool {
    match role {
        "admin" => true,
        "user" => resource == user_id.to_string(),
        _ => false,
    }
}

// Registry commands

/// Register a new user. A payload without `user_id` gets a fresh one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateUser {
    #[serde(default = "Uuid::new_v4")]
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeUserEmail {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeactivateUser {
    pub user_id: Uuid,
    #[serde(default)]
    pub reason: String,
}

impl Command for CreateUser {
    fn command_type(&self) -> &str {
        "CreateUser"
    }

    fn aggregate_type(&self) -> &str {
        USER_AGGREGATE
    }

    fn aggregate_id(&self) -> Uuid {
        self.user_id
    }

    // Self-service sign-up: anyone holding a role may create an account.
    fn is_authorized(&self, role: &str, _scope: &str, _resource: &str) -> bool {
        !role.is_empty()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Command for ChangeUserEmail {
    fn command_type(&self) -> &str {
        "ChangeUserEmail"
    }

    fn aggregate_type(&self) -> &str {
        USER_AGGREGATE
    }

    fn aggregate_id(&self) -> Uuid {
        self.user_id
    }

    fn is_authorized(&self, role: &str, _scope: &str, resource: &str) -> bool {
        authorized_for(self.user_id, role, resource)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Command for DeactivateUser {
    fn command_type(&self) -> &str {
        "DeactivateUser"
    }

    fn aggregate_type(&self) -> &str {
        USER_AGGREGATE
    }

    fn aggregate_id(&self) -> Uuid {
        self.user_id
    }

    fn is_authorized(&self, role: &str, _scope: &str, resource: &str) -> bool {
        authorized_for(self.user_id, role, resource)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
