use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::event_sourcing::core::{AggregateType, Event};

// ============================================================================
// Event Store Contract
// ============================================================================
//
// Responsibilities of every backend:
// 1. Append events per aggregate, all-or-nothing
// 2. Reject batches that break version order or hit an existing version
// 3. Load events by filter, ascending version within an aggregate
//
// The store never retries. A conflict goes back to the caller, which owns
// the reload-and-retry policy.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no events to append")]
    NoEventsToAppend,

    #[error("events in one batch must share aggregate type and id")]
    InvalidAggregateType,

    #[error("incorrect aggregate version: expected {expected}, got {actual}")]
    IncorrectAggregateVersion { expected: u64, actual: u64 },

    #[error("aggregate {aggregate_type}/{aggregate_id} already has version {version}")]
    AggregateVersionAlreadyExists {
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
        version: u64,
    },

    #[error("event store is not connected")]
    NotConnected,

    #[error("event store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Optimistic-concurrency failures, recovered by reloading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::AggregateVersionAlreadyExists { .. }
                | StoreError::IncorrectAggregateVersion { .. }
                | StoreError::InvalidAggregateType
        )
    }

    /// Conflicts a reload can resolve. A mixed batch fails the same way
    /// every time, so it is left out.
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::AggregateVersionAlreadyExists { .. } | StoreError::IncorrectAggregateVersion { .. }
        )
    }
}

/// Filter for [`Store::load`]. Every field that is set must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreQuery {
    pub aggregate_id: Option<Uuid>,
    pub aggregate_type: Option<AggregateType>,
    pub min_version: Option<u64>,
    pub max_version: Option<u64>,
    pub min_timestamp: Option<DateTime<Utc>>,
    pub max_timestamp: Option<DateTime<Utc>>,
}

/// Same shape, used where the filter is applied to a stream of events.
pub type EventFilter = StoreQuery;

impl StoreQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full history of one aggregate.
    pub fn for_aggregate(aggregate_type: AggregateType, aggregate_id: Uuid) -> Self {
        Self {
            aggregate_id: Some(aggregate_id),
            aggregate_type: Some(aggregate_type),
            ..Self::default()
        }
    }

    pub fn with_aggregate_id(mut self, aggregate_id: Uuid) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn with_aggregate_type(mut self, aggregate_type: AggregateType) -> Self {
        self.aggregate_type = Some(aggregate_type);
        self
    }

    pub fn with_min_version(mut self, version: u64) -> Self {
        self.min_version = Some(version);
        self
    }

    pub fn with_max_version(mut self, version: u64) -> Self {
        self.max_version = Some(version);
        self
    }

    pub fn with_min_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.min_timestamp = Some(timestamp);
        self
    }

    pub fn with_max_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.max_timestamp = Some(timestamp);
        self
    }

    /// Inclusive bounds on every range field.
    pub fn matches(&self, event: &Event) -> bool {
        if self.aggregate_id.is_some_and(|id| id != event.aggregate_id()) {
            return false;
        }
        if let Some(aggregate_type) = &self.aggregate_type {
            if aggregate_type != event.aggregate_type() {
                return false;
            }
        }
        let version = event.aggregate_version();
        if self.min_version.is_some_and(|min| version < min) {
            return false;
        }
        if self.max_version.is_some_and(|max| version > max) {
            return false;
        }
        let timestamp = event.timestamp();
        if self.min_timestamp.is_some_and(|min| timestamp < min) {
            return false;
        }
        if self.max_timestamp.is_some_and(|max| timestamp > max) {
            return false;
        }
        true
    }
}

/// Append-only, per-aggregate event log.
#[async_trait]
pub trait Store: Send + Sync {
    async fn connect(&self) -> Result<(), StoreError>;

    /// Append a batch for one aggregate atomically.
    async fn save(&self, events: &[Event]) -> Result<(), StoreError>;

    async fn load(&self, query: &StoreQuery) -> Result<Vec<Event>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Batch preconditions shared by all backends: non-empty, one aggregate,
/// strictly consecutive versions. Existence checks are backend specific.
pub fn validate_batch(events: &[Event]) -> Result<(), StoreError> {
    let Some(first) = events.first() else {
        return Err(StoreError::NoEventsToAppend);
    };

    for (offset, event) in events.iter().enumerate() {
        if event.aggregate_id() != first.aggregate_id()
            || event.aggregate_type() != first.aggregate_type()
        {
            return Err(StoreError::InvalidAggregateType);
        }

        let Some(expected) = first.aggregate_version().checked_add(offset as u64) else {
            return Err(StoreError::IncorrectAggregateVersion {
                expected: u64::MAX,
                actual: event.aggregate_version(),
            });
        };
        if event.aggregate_version() != expected {
            return Err(StoreError::IncorrectAggregateVersion {
                expected,
                actual: event.aggregate_version(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use crate::event_sourcing::core::{AggregateType, Event, EventType, Payload};

    pub fn event(aggregate_type: &str, id: Uuid, version: u64) -> Event {
        event_at(aggregate_type, id, version, Utc::now())
    }

    pub fn event_at(aggregate_type: &str, id: Uuid, version: u64, at: DateTime<Utc>) -> Event {
        Event::new(
            EventType::new("Touched").unwrap(),
            Payload::new("Touched", format!("{{\"v\":{version}}}").into_bytes()),
            at,
            AggregateType::new(aggregate_type).unwrap(),
            id,
            version,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{event, event_at};
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_validate_rejects_empty_batch() {
        assert!(matches!(validate_batch(&[]), Err(StoreError::NoEventsToAppend)));
    }

    #[test]
    fn test_validate_rejects_mixed_aggregates() {
        let id = Uuid::new_v4();
        let mixed_ids = vec![event("User", id, 0), event("User", Uuid::new_v4(), 1)];
        assert!(matches!(validate_batch(&mixed_ids), Err(StoreError::InvalidAggregateType)));

        let mixed_types = vec![event("User", id, 0), event("Cluster", id, 1)];
        assert!(matches!(validate_batch(&mixed_types), Err(StoreError::InvalidAggregateType)));
    }

    #[test]
    fn test_validate_rejects_skipped_version() {
        let id = Uuid::new_v4();
        let batch = vec![event("User", id, 3), event("User", id, 5)];
        assert!(matches!(
            validate_batch(&batch),
            Err(StoreError::IncorrectAggregateVersion { expected: 4, actual: 5 })
        ));
    }

    #[test]
    fn test_validate_rejects_batch_past_max_version() {
        let id = Uuid::new_v4();
        let batch = vec![event("User", id, u64::MAX), event("User", id, u64::MAX)];
        assert!(matches!(
            validate_batch(&batch),
            Err(StoreError::IncorrectAggregateVersion { actual: u64::MAX, .. })
        ));
    }

    #[test]
    fn test_query_ands_all_fields() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let e = event_at("User", id, 2, now);

        assert!(StoreQuery::new().matches(&e));
        assert!(StoreQuery::for_aggregate(AggregateType::new("User").unwrap(), id).matches(&e));
        assert!(!StoreQuery::new().with_aggregate_id(Uuid::new_v4()).matches(&e));
        assert!(!StoreQuery::new()
            .with_aggregate_type(AggregateType::new("Cluster").unwrap())
            .matches(&e));
        assert!(StoreQuery::new().with_min_version(2).with_max_version(2).matches(&e));
        assert!(!StoreQuery::new().with_min_version(3).matches(&e));
        assert!(!StoreQuery::new().with_max_version(1).matches(&e));
        assert!(!StoreQuery::new().with_min_timestamp(now + Duration::seconds(1)).matches(&e));
        assert!(!StoreQuery::new().with_max_timestamp(now - Duration::seconds(1)).matches(&e));
    }

    #[test]
    fn test_conflict_classification() {
        assert!(StoreError::InvalidAggregateType.is_conflict());
        assert!(StoreError::IncorrectAggregateVersion { expected: 1, actual: 2 }.is_conflict());
        assert!(!StoreError::NoEventsToAppend.is_conflict());
        assert!(!StoreError::NotConnected.is_conflict());

        assert!(!StoreError::InvalidAggregateType.is_version_conflict());
        assert!(StoreError::IncorrectAggregateVersion { expected: 1, actual: 2 }.is_version_conflict());
        assert!(!StoreError::NotConnected.is_version_conflict());
    }
}
