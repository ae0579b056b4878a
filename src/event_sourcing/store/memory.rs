use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::event_store::{validate_batch, Store, StoreError, StoreQuery};
use crate::event_sourcing::core::{AggregateType, Event};
use crate::metrics::Metrics;

// ============================================================================
// In-Memory Event Store
// ============================================================================
//
// Reference backend for tests and local runs. Keeps the log in insertion
// order plus the next expected version per aggregate, which doubles as the
// optimistic-concurrency check.
//
// ============================================================================

#[derive(Default)]
struct MemoryLog {
    connected: bool,
    events: Vec<Event>,
    next_versions: HashMap<(AggregateType, Uuid), u64>,
}

#[derive(Default)]
pub struct MemoryStore {
    log: RwLock<MemoryLog>,
    metrics: Option<Arc<Metrics>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.log.write().await.connected = true;
        tracing::debug!("In-memory event store connected");
        Ok(())
    }

    async fn save(&self, events: &[Event]) -> Result<(), StoreError> {
        validate_batch(events)?;

        // validate_batch guarantees a first element
        let first = &events[0];
        let key = (first.aggregate_type().clone(), first.aggregate_id());

        let mut log = self.log.write().await;
        if !log.connected {
            return Err(StoreError::NotConnected);
        }

        let next = log.next_versions.get(&key).copied().unwrap_or(0);
        let requested = first.aggregate_version();
        if requested < next {
            if let Some(metrics) = &self.metrics {
                metrics.record_store_conflict(first.aggregate_type().as_str());
            }
            tracing::warn!(
                aggregate_id = %first.aggregate_id(),
                aggregate_type = %first.aggregate_type(),
                version = requested,
                current_version = next,
                "Rejected append: version already exists"
            );
            return Err(StoreError::AggregateVersionAlreadyExists {
                aggregate_type: first.aggregate_type().clone(),
                aggregate_id: first.aggregate_id(),
                version: requested,
            });
        }
        if requested > next {
            if let Some(metrics) = &self.metrics {
                metrics.record_store_conflict(first.aggregate_type().as_str());
            }
            return Err(StoreError::IncorrectAggregateVersion {
                expected: next,
                actual: requested,
            });
        }

        log.events.extend_from_slice(events);
        let new_next = next + events.len() as u64;
        log.next_versions.insert(key, new_next);

        if let Some(metrics) = &self.metrics {
            metrics.record_events_saved(first.aggregate_type().as_str(), events.len());
        }

        tracing::info!(
            aggregate_id = %first.aggregate_id(),
            aggregate_type = %first.aggregate_type(),
            new_version = new_next,
            event_count = events.len(),
            "Appended events to event store"
        );

        Ok(())
    }

    async fn load(&self, query: &StoreQuery) -> Result<Vec<Event>, StoreError> {
        let log = self.log.read().await;
        if !log.connected {
            return Err(StoreError::NotConnected);
        }

        let events: Vec<Event> = log
            .events
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect();

        tracing::debug!(count = events.len(), ?query, "Loaded events");
        Ok(events)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.log.write().await.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::store::event_store::test_support::event;

    async fn connected_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.connect().await.unwrap();
        store
    }

    fn user() -> AggregateType {
        AggregateType::new("User").unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load_in_version_order() {
        let store = connected_store().await;
        let id = Uuid::new_v4();

        store.save(&[event("User", id, 0), event("User", id, 1)]).await.unwrap();
        store.save(&[event("User", id, 2)]).await.unwrap();

        let loaded = store.load(&StoreQuery::for_aggregate(user(), id)).await.unwrap();
        let versions: Vec<u64> = loaded.iter().map(|e| e.aggregate_version()).collect();
        assert_eq!(versions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_existing_version_is_rejected_and_unchanged() {
        let store = connected_store().await;
        let id = Uuid::new_v4();
        let original = event("User", id, 0);
        store.save(std::slice::from_ref(&original)).await.unwrap();

        let result = store.save(&[event("User", id, 0)]).await;
        assert!(matches!(
            result,
            Err(StoreError::AggregateVersionAlreadyExists { version: 0, .. })
        ));

        let loaded = store.load(&StoreQuery::new()).await.unwrap();
        assert_eq!(loaded, vec![original]);
    }

    #[tokio::test]
    async fn test_skipping_a_version_fails() {
        let store = connected_store().await;
        let id = Uuid::new_v4();
        store.save(&[event("User", id, 0)]).await.unwrap();

        let result = store.save(&[event("User", id, 2)]).await;
        assert!(matches!(
            result,
            Err(StoreError::IncorrectAggregateVersion { expected: 1, actual: 2 })
        ));

        let gapped = store.save(&[event("User", id, 1), event("User", id, 3)]).await;
        assert!(matches!(gapped, Err(StoreError::IncorrectAggregateVersion { .. })));
    }

    #[tokio::test]
    async fn test_mixed_batch_writes_nothing() {
        let store = connected_store().await;
        let id = Uuid::new_v4();

        let result = store
            .save(&[event("User", id, 0), event("User", Uuid::new_v4(), 1)])
            .await;
        assert!(matches!(result, Err(StoreError::InvalidAggregateType)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_version_range_filter() {
        let store = connected_store().await;
        let id = Uuid::new_v4();
        store
            .save(&[event("User", id, 0), event("User", id, 1), event("User", id, 2)])
            .await
            .unwrap();

        let query = StoreQuery::for_aggregate(user(), id)
            .with_min_version(1)
            .with_max_version(1);
        let loaded = store.load(&query).await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].aggregate_version(), 1);
    }

    #[tokio::test]
    async fn test_aggregates_are_isolated() {
        let store = connected_store().await;
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.save(&[event("User", a, 0)]).await.unwrap();
        store.save(&[event("User", b, 0)]).await.unwrap();
        store.save(&[event("Cluster", a, 0)]).await.unwrap();

        let only_a = store.load(&StoreQuery::for_aggregate(user(), a)).await.unwrap();
        assert_eq!(only_a.len(), 1);

        let users = store
            .load(&StoreQuery::new().with_aggregate_type(user()))
            .await
            .unwrap();
        assert_eq!(users.len(), 2);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.save(&[event("User", id, 0)]).await,
            Err(StoreError::NotConnected)
        ));

        store.connect().await.unwrap();
        store.save(&[event("User", id, 0)]).await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.load(&StoreQuery::new()).await,
            Err(StoreError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_conflicts_are_counted() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = MemoryStore::new().with_metrics(metrics.clone());
        store.connect().await.unwrap();
        let id = Uuid::new_v4();

        store.save(&[event("User", id, 0)]).await.unwrap();
        let _ = store.save(&[event("User", id, 0)]).await;

        assert_eq!(metrics.store_conflicts.with_label_values(&["User"]).get(), 1);
        assert_eq!(metrics.events_saved.with_label_values(&["User"]).get(), 1);
    }
}
