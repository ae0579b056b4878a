use std::sync::Arc;

use uuid::Uuid;

use super::core::{Aggregate, AggregateError, Event};
use super::store::{Store, StoreError, StoreQuery};
use crate::messaging::EventBus;

// ============================================================================
// Aggregate Manager - load, execute, save, publish
// ============================================================================
//
// The command-handling call site for one aggregate. A save rejected by the
// store's version check is retried from a fresh load, up to
// `max_conflict_retries` times. Events are published only after the store
// accepted them; a publish failure at that point is logged and left to the
// query side's refresh to reconcile.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Reload-and-retry rounds after the first conflicting save
    pub max_conflict_retries: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError<E: std::error::Error + Send + Sync + 'static> {
    #[error(transparent)]
    Aggregate(#[from] AggregateError<E>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("aggregate {aggregate_id} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { aggregate_id: Uuid, attempts: u32 },
}

pub struct AggregateManager {
    store: Arc<dyn Store>,
    bus: Option<Arc<dyn EventBus>>,
    config: ManagerConfig,
}

impl AggregateManager {
    pub fn new(store: Arc<dyn Store>, config: ManagerConfig) -> Self {
        Self {
            store,
            bus: None,
            config,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Rebuild an aggregate from every stored event for `id`.
    pub async fn load<A: Aggregate>(&self, id: Uuid) -> Result<A, ManagerError<A::Error>> {
        let aggregate_type = A::aggregate_type().map_err(AggregateError::Model)?;
        let mut history = self
            .store
            .load(&StoreQuery::for_aggregate(aggregate_type, id))
            .await?;
        history.sort_by_key(Event::aggregate_version);
        Ok(A::load_from_events(id, &history)?)
    }

    /// Run a command against the current state of aggregate `id` and persist
    /// the resulting events. Returns the events as saved.
    pub async fn execute<A: Aggregate>(
        &self,
        id: Uuid,
        command: &A::Command,
    ) -> Result<Vec<Event>, ManagerError<A::Error>> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let mut aggregate: A = self.load(id).await?;
            aggregate.execute(command)?;
            let events = aggregate.root_mut().take_events();
            if events.is_empty() {
                return Ok(events);
            }

            match self.store.save(&events).await {
                Ok(()) => {
                    tracing::debug!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        aggregate_id = %id,
                        count = events.len(),
                        attempt = attempt,
                        "Command committed"
                    );
                    self.publish(&events).await;
                    return Ok(events);
                }
                Err(err) if err.is_version_conflict() => {
                    if attempt > self.config.max_conflict_retries {
                        return Err(ManagerError::ConflictRetriesExhausted {
                            aggregate_id: id,
                            attempts: attempt,
                        });
                    }
                    tracing::warn!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        aggregate_id = %id,
                        attempt = attempt,
                        error = %err,
                        "Concurrent write detected, reloading aggregate"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn publish(&self, events: &[Event]) {
        let Some(bus) = &self.bus else {
            return;
        };
        for event in events {
            if let Err(e) = bus.publish_event(event).await {
                tracing::error!(
                    event_type = %event.event_type(),
                    aggregate_id = %event.aggregate_id(),
                    version = event.aggregate_version(),
                    error = %e,
                    "Event saved but not published"
                );
            }
        }
    }
}
