use uuid::Uuid;

use crate::event_sourcing::{EventType, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("projection {0} not found")]
    NotFound(Uuid),

    /// The event is ahead of the projection. Consumed by the replay
    /// middleware as a signal to catch up from the store.
    #[error("projection {aggregate_id} is outdated: expected version {expected}, got {actual}")]
    Outdated {
        aggregate_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("projector failed on {event_type}: {source}")]
    Projector {
        event_type: EventType,
        #[source]
        source: anyhow::Error,
    },

    #[error("projection {aggregate_id} still outdated after {attempts} catch-up attempts")]
    CatchUpExhausted { aggregate_id: Uuid, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProjectionError {
    pub fn is_outdated(&self) -> bool {
        matches!(self, ProjectionError::Outdated { .. })
    }
}
