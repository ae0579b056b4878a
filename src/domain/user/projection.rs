use std::collections::HashSet;

use anyhow::Context;
use uuid::Uuid;

use super::commands::USER_AGGREGATE;
use super::events::*;
use super::value_objects::UserStatus;
use crate::event_sourcing::{AggregateType, Event, EventType};
use crate::projection::{Projection, Projector};

// ============================================================================
// User Read Model
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct UserView {
    pub id: Uuid,
    /// Next event version this view expects
    pub version: u64,
    pub email: String,
    pub name: String,
    pub status: UserStatus,
}

impl Projection for UserView {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

pub struct UserProjector;

impl Projector for UserProjector {
    type Projection = UserView;

    fn event_types(&self) -> HashSet<EventType> {
        [USER_CREATED, USER_EMAIL_CHANGED, USER_DEACTIVATED]
            .into_iter()
            .filter_map(|t| EventType::new(t).ok())
            .collect()
    }

    fn aggregate_types(&self) -> HashSet<AggregateType> {
        AggregateType::new(USER_AGGREGATE).into_iter().collect()
    }

    fn can_create(&self, event: &Event) -> bool {
        event.event_type() == USER_CREATED
    }

    fn new_projection(&self, id: Uuid) -> UserView {
        UserView {
            id,
            version: 0,
            email: String::new(),
            name: String::new(),
            status: UserStatus::Active,
        }
    }

    fn project(&self, event: &Event, mut view: UserView) -> anyhow::Result<UserView> {
        let data: UserEvent = event
            .decode()
            .with_context(|| format!("decoding {} for user {}", event.event_type(), event.aggregate_id()))?;

        match data {
            UserEvent::Created(e) => {
                view.email = e.email.as_str().to_string();
                view.name = e.name;
                view.status = UserStatus::Active;
            }
            UserEvent::EmailChanged(e) => {
                view.email = e.new_email.as_str().to_string();
            }
            UserEvent::Deactivated(_) => {
                view.status = UserStatus::Deactivated;
            }
        }
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::user::{UserAggregate, UserCommand};
    use crate::event_sourcing::Aggregate;
    use crate::projection::{
        EventHandler, MemoryRepository, ProjectingEventHandler, ProjectionError, Repository, Resync,
    };

    fn history(id: Uuid) -> Vec<Event> {
        let mut user = UserAggregate::new(id).unwrap();
        for command in [
            UserCommand::Create {
                email: "a@b.co".to_string(),
                name: "A".to_string(),
            },
            UserCommand::ChangeEmail {
                email: "c@d.co".to_string(),
            },
            UserCommand::Deactivate {
                reason: "left".to_string(),
            },
        ] {
            user.execute(&command).unwrap();
        }
        user.root_mut().take_events()
    }

    #[tokio::test]
    async fn test_view_follows_user_lifecycle() {
        let id = Uuid::new_v4();
        let repository = MemoryRepository::new();
        let handler = ProjectingEventHandler::new(UserProjector, repository.clone());

        for event in history(id) {
            handler.handle_event(&event).await.unwrap();
        }

        let view = repository.by_id(id).await.unwrap();
        assert_eq!(view.email, "c@d.co");
        assert_eq!(view.status, UserStatus::Deactivated);
        assert_eq!(view.version, 3);
    }

    #[tokio::test]
    async fn test_out_of_order_event_reports_outdated() {
        let id = Uuid::new_v4();
        let events = history(id);
        let handler = ProjectingEventHandler::new(UserProjector, MemoryRepository::new());

        handler.handle_event(&events[0]).await.unwrap();
        let result = handler.handle_event(&events[2]).await;

        assert!(matches!(
            result,
            Err(ProjectionError::Outdated { expected: 1, actual: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_resync_rebuilds_from_history() {
        let id = Uuid::new_v4();
        let repository = MemoryRepository::new();
        let handler = ProjectingEventHandler::new(UserProjector, repository.clone());

        handler.resync(id, &history(id)[..2]).await.unwrap();

        let view = repository.by_id(id).await.unwrap();
        assert_eq!(view.email, "c@d.co");
        assert_eq!(view.status, UserStatus::Active);
        assert_eq!(view.version, 2);
    }
}
