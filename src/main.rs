use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::try_join_all;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use cluster_events::commands::CommandRegistry;
use cluster_events::config::Config;
use cluster_events::domain::user::{
    register_user_commands, UserCommandHandler, UserProjector, UserView, USER_AGGREGATE,
};
use cluster_events::event_sourcing::{
    AccessContext, AggregateManager, AggregateType, MemoryStore, Payload, Store,
};
use cluster_events::messaging::{BrokerEventBus, EventBus, Matcher, MemoryBroker};
use cluster_events::metrics::Metrics;
use cluster_events::projection::{
    warm_up, MemoryRepository, ProjectingEventHandler, ProjectionError, RefreshConfig, RefreshMiddleware,
    ReplayMiddleware, Repository,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cluster_events=debug")),
        )
        .init();

    tracing::info!("🚀 Starting cluster events demo");

    let config = Config::from_env().context("loading configuration")?;
    let metrics = Arc::new(Metrics::new()?);
    let user_type = AggregateType::new(USER_AGGREGATE)?;

    // === 1. Event store ===
    let store = Arc::new(MemoryStore::new().with_metrics(metrics.clone()));
    store.connect().await?;

    // === 2. Event bus over the in-process broker ===
    let broker = MemoryBroker::new();
    let bus = Arc::new(BrokerEventBus::connect(Arc::new(broker), config.bus(), Some(metrics.clone())).await?);

    // === 3. Read side: projector → handler → refresh → replay ===
    let views: MemoryRepository<UserView> = MemoryRepository::new();
    let refresh = Arc::new(
        RefreshMiddleware::new(
            ProjectingEventHandler::new(UserProjector, views.clone()),
            store.clone(),
            RefreshConfig {
                aggregate_types: vec![user_type.clone()],
                ..config.refresh()
            },
        )
        .with_metrics(metrics.clone()),
    );

    let warmed = warm_up(store.as_ref(), refresh.as_ref(), &[user_type.clone()]).await?;
    tracing::info!(aggregates = warmed, "Read model warmed up");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh_task = refresh.clone().start(shutdown_rx);

    let handler = ReplayMiddleware::new(refresh, store.clone(), config.max_catch_up_attempts)
        .with_metrics(metrics.clone());
    bus.add_handler(Arc::new(handler), &[Matcher::aggregate_type(user_type.clone())])
        .await?;

    // === 4. Write side: registry → handler → manager → store + bus ===
    let manager = AggregateManager::new(store.clone(), config.manager()).with_bus(bus.clone());
    let registry = Arc::new(CommandRegistry::new().with_metrics(metrics.clone()));
    register_user_commands(&registry, Arc::new(UserCommandHandler::new(Arc::new(manager)))).await?;

    // === 5. Submit a few users concurrently ===
    let admin = AccessContext::new("admin", "users", "*");
    let signups = [("a@b.co", "A"), ("grace@example.com", "Grace"), ("linus@example.com", "Linus")];
    let user_ids = try_join_all(signups.iter().map(|(email, name)| {
        let registry = registry.clone();
        let admin = admin.clone();
        async move {
            let payload = Payload::new(
                "CreateUser",
                serde_json::to_vec(&serde_json::json!({ "email": email, "name": name }))?,
            );
            let command = registry.create_command("CreateUser", &payload).await?;
            registry.handle_command_as(&admin, command.as_ref()).await?;
            anyhow::Ok(command.aggregate_id())
        }
    }))
    .await?;
    tracing::info!(count = user_ids.len(), "✅ Users created");

    // === 6. Query the read model ===
    for id in &user_ids {
        let view = wait_for_view(&views, *id).await?;
        tracing::info!(user_id = %view.id, email = %view.email, name = %view.name, version = view.version, "📖 User view");
    }

    println!("{}", metrics.encode()?);

    // === 7. Shutdown ===
    let _ = shutdown_tx.send(true);
    refresh_task.await?;
    bus.close().await?;
    store.close().await?;

    tracing::info!("🎉 Demo complete!");
    Ok(())
}

async fn wait_for_view(views: &MemoryRepository<UserView>, id: Uuid) -> anyhow::Result<UserView> {
    let lookup = async {
        loop {
            match views.by_id(id).await {
                Ok(view) => return Ok(view),
                Err(ProjectionError::NotFound(_)) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(e) => return Err(e),
            }
        }
    };
    Ok(tokio::time::timeout(Duration::from_secs(5), lookup)
        .await
        .with_context(|| format!("user {id} never reached the read model"))??)
}
