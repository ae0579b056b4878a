use std::collections::HashSet;

use uuid::Uuid;

use crate::event_sourcing::{AggregateType, Event, EventType};

/// A read model keyed by aggregate id.
pub trait Projection: Clone + Send + Sync + 'static {
    fn id(&self) -> Uuid;

    /// Next event version this projection expects, if it tracks one.
    /// Unversioned projections accept every event in arrival order.
    fn version(&self) -> Option<u64> {
        None
    }

    fn set_version(&mut self, _version: u64) {}
}

/// Folds events into a projection.
///
/// `project` must be a pure function of the event and the projection so that
/// replaying a stream always yields the same state.
pub trait Projector: Send + Sync + 'static {
    type Projection: Projection;

    /// Event types this projector applies. Empty means all.
    fn event_types(&self) -> HashSet<EventType>;

    /// Aggregate types this projector follows. Empty means all.
    fn aggregate_types(&self) -> HashSet<AggregateType>;

    /// Whether `event` may create the projection when none exists yet.
    fn can_create(&self, event: &Event) -> bool;

    fn new_projection(&self, id: Uuid) -> Self::Projection;

    fn project(&self, event: &Event, projection: Self::Projection) -> anyhow::Result<Self::Projection>;

    fn follows(&self, event: &Event) -> bool {
        let types = self.aggregate_types();
        types.is_empty() || types.contains(event.aggregate_type())
    }

    fn is_interested(&self, event: &Event) -> bool {
        let types = self.event_types();
        self.follows(event) && (types.is_empty() || types.contains(event.event_type()))
    }
}
