use crate::event_sourcing::{Aggregate, AggregateRoot};

use super::commands::{UserCommand, USER_AGGREGATE};
use super::errors::UserError;
use super::events::*;
use super::value_objects::{Email, UserStatus};

// ============================================================================
// User Aggregate - Business Logic
// ============================================================================

#[derive(Debug, Clone)]
pub struct UserAggregate {
    root: AggregateRoot,
    pub email: Option<Email>,
    pub name: String,
    /// `None` until the user has been created
    pub status: Option<UserStatus>,
}

impl UserAggregate {
    fn validate_active(&self) -> Result<(), UserError> {
        match self.status {
            Some(UserStatus::Active) => Ok(()),
            Some(UserStatus::Deactivated) => Err(UserError::Deactivated(self.root.id())),
            None => Err(UserError::NotFound(self.root.id())),
        }
    }
}

impl Aggregate for UserAggregate {
    type Event = UserEvent;
    type Command = UserCommand;
    type Error = UserError;

    const AGGREGATE_TYPE: &'static str = USER_AGGREGATE;

    fn from_root(root: AggregateRoot) -> Self {
        Self {
            root,
            email: None,
            name: String::new(),
            status: None,
        }
    }

    fn root(&self) -> &AggregateRoot {
        &self.root
    }

    fn root_mut(&mut self) -> &mut AggregateRoot {
        &mut self.root
    }

    fn apply_event(&mut self, event: &UserEvent) -> Result<(), UserError> {
        match event {
            UserEvent::Created(e) => {
                if self.status.is_some() {
                    return Err(UserError::AlreadyExists(self.root.id()));
                }
                self.email = Some(e.email.clone());
                self.name = e.name.clone();
                self.status = Some(UserStatus::Active);
            }
            UserEvent::EmailChanged(e) => {
                self.email = Some(e.new_email.clone());
            }
            UserEvent::Deactivated(_) => {
                self.status = Some(UserStatus::Deactivated);
            }
        }
        Ok(())
    }

    fn handle_command(&self, command: &UserCommand) -> Result<Vec<UserEvent>, UserError> {
        match command {
            UserCommand::Create { email, name } => {
                if self.status.is_some() {
                    return Err(UserError::AlreadyExists(self.root.id()));
                }
                let email = Email::parse(email.as_str())?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(UserError::EmptyName);
                }
                Ok(vec![UserEvent::Created(UserCreated {
                    email,
                    name: name.to_string(),
                })])
            }
            UserCommand::ChangeEmail { email } => {
                self.validate_active()?;
                let new_email = Email::parse(email.as_str())?;
                match &self.email {
                    // Nothing to record
                    Some(current) if *current == new_email => Ok(vec![]),
                    Some(current) => Ok(vec![UserEvent::EmailChanged(UserEmailChanged {
                        old_email: current.clone(),
                        new_email,
                    })]),
                    None => Err(UserError::NotFound(self.root.id())),
                }
            }
            UserCommand::Deactivate { reason } => {
                self.validate_active()?;
                Ok(vec![UserEvent::Deactivated(UserDeactivated {
                    reason: reason.clone(),
                })])
            }
        }
    }
}
