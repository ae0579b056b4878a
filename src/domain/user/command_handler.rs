use std::sync::Arc;

use async_trait::async_trait;

use super::aggregate::UserAggregate;
use super::commands::{ChangeUserEmail, CreateUser, DeactivateUser, UserCommand};
use crate::commands::{CommandHandler, CommandRegistry, RegistryError};
use crate::event_sourcing::{AggregateManager, Command};

// ============================================================================
// User Command Handler
// ============================================================================
//
// Orchestrates: Command → Aggregate → Events → Store → Bus
//
// ============================================================================

pub const USER_COMMAND_TYPES: [&str; 3] = ["CreateUser", "ChangeUserEmail", "DeactivateUser"];

pub struct UserCommandHandler {
    manager: Arc<AggregateManager>,
}

impl UserCommandHandler {
    pub fn new(manager: Arc<AggregateManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl CommandHandler for UserCommandHandler {
    async fn handle_command(&self, command: &dyn Command) -> anyhow::Result<()> {
        let (user_id, user_command) = UserCommand::from_command(command)?;
        let events = self
            .manager
            .execute::<UserAggregate>(user_id, &user_command)
            .await?;

        tracing::info!(
            user_id = %user_id,
            command_type = command.command_type(),
            events = events.len(),
            "User command handled"
        );
        Ok(())
    }
}

/// Register every user command type and bind them all to `handler`.
pub async fn register_user_commands(
    registry: &CommandRegistry,
    handler: Arc<UserCommandHandler>,
) -> Result<(), RegistryError> {
    registry.register_command(|| Some(CreateUser::default())).await?;
    registry.register_command(|| Some(ChangeUserEmail::default())).await?;
    registry.register_command(|| Some(DeactivateUser::default())).await?;

    for command_type in USER_COMMAND_TYPES {
        registry.set_handler(handler.clone(), command_type).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::domain::user::{UserProjector, UserStatus, UserView};
    use crate::event_sourcing::{
        AccessContext, AggregateType, ManagerConfig, MemoryStore, Payload, Store, StoreQuery,
    };
    use crate::messaging::{BrokerEventBus, BusConfig, EventBus, Matcher, MemoryBroker};
    use crate::projection::{
        MemoryRepository, ProjectingEventHandler, ProjectionError, ReplayMiddleware, Repository,
    };
    use uuid::Uuid;

    struct Runtime {
        store: Arc<MemoryStore>,
        bus: Arc<BrokerEventBus>,
        registry: CommandRegistry,
        views: MemoryRepository<UserView>,
    }

    async fn runtime() -> Runtime {
        let store = Arc::new(MemoryStore::new());
        store.connect().await.unwrap();

        let broker = MemoryBroker::new();
        let bus = Arc::new(
            BrokerEventBus::connect(Arc::new(broker), BusConfig::default(), None)
                .await
                .unwrap(),
        );

        let views = MemoryRepository::new();
        let handler = ReplayMiddleware::new(
            ProjectingEventHandler::new(UserProjector, views.clone()),
            store.clone(),
            3,
        );
        bus.add_handler(
            Arc::new(handler),
            &[Matcher::aggregate_type(AggregateType::new("User").unwrap())],
        )
        .await
        .unwrap();

        let manager = AggregateManager::new(store.clone(), ManagerConfig::default()).with_bus(bus.clone());
        let registry = CommandRegistry::new();
        register_user_commands(&registry, Arc::new(UserCommandHandler::new(Arc::new(manager))))
            .await
            .unwrap();

        Runtime {
            store,
            bus,
            registry,
            views,
        }
    }

    async fn wait_for_view(views: &MemoryRepository<UserView>, id: Uuid, version: u64) -> UserView {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match views.by_id(id).await {
                    Ok(view) if view.version >= version => return view,
                    Ok(_) | Err(ProjectionError::NotFound(_)) => {}
                    Err(e) => panic!("repository failed: {e}"),
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("projection never caught up")
    }

    #[tokio::test]
    async fn test_created_user_reaches_the_read_model() {
        let rt = runtime().await;

        let payload = Payload::new("CreateUser", br#"{"email":"a@b.co","name":"A"}"#.to_vec());
        let command = rt.registry.create_command("CreateUser", &payload).await.unwrap();
        let user_id = command.aggregate_id();
        rt.registry.handle_command(command.as_ref()).await.unwrap();

        let stored = rt
            .store
            .load(&StoreQuery::for_aggregate(AggregateType::new("User").unwrap(), user_id))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_type().as_str(), "UserCreated");
        assert_eq!(stored[0].aggregate_version(), 0);

        let view = wait_for_view(&rt.views, user_id, 1).await;
        assert_eq!(view.email, "a@b.co");
        assert_eq!(view.name, "A");

        rt.bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_follow_up_commands_update_the_view() {
        let rt = runtime().await;
        let user_id = Uuid::new_v4();
        let admin = AccessContext::new("admin", "users", "*");

        let create = CreateUser {
            user_id,
            email: "a@b.co".to_string(),
            name: "A".to_string(),
        };
        rt.registry.handle_command_as(&admin, &create).await.unwrap();

        let change = Payload::encode(
            "ChangeUserEmail",
            &ChangeUserEmail {
                user_id,
                email: "c@d.co".to_string(),
            },
        )
        .unwrap();
        let change = rt.registry.create_command("ChangeUserEmail", &change).await.unwrap();
        rt.registry.handle_command_as(&admin, change.as_ref()).await.unwrap();

        let deactivate = DeactivateUser {
            user_id,
            reason: "left".to_string(),
        };
        let own = AccessContext::new("user", "users", user_id.to_string());
        rt.registry.handle_command_as(&own, &deactivate).await.unwrap();

        let view = wait_for_view(&rt.views, user_id, 3).await;
        assert_eq!(view.email, "c@d.co");
        assert_eq!(view.status, UserStatus::Deactivated);

        rt.bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_business_rule_failure_surfaces_and_stores_nothing() {
        let rt = runtime().await;
        let user_id = Uuid::new_v4();

        let result = rt
            .registry
            .handle_command(&ChangeUserEmail {
                user_id,
                email: "a@b.co".to_string(),
            })
            .await;

        assert!(matches!(result, Err(RegistryError::HandlerFailed { .. })));
        assert!(rt.store.is_empty().await);

        rt.bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_user_cannot_deactivate() {
        let rt = runtime().await;
        let deactivate = DeactivateUser {
            user_id: Uuid::new_v4(),
            reason: String::new(),
        };
        let someone_else = AccessContext::new("user", "users", Uuid::new_v4().to_string());

        let result = rt.registry.handle_command_as(&someone_else, &deactivate).await;

        assert!(matches!(result, Err(RegistryError::Unauthorized { .. })));
        rt.bus.close().await.unwrap();
    }
}
