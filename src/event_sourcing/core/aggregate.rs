use chrono::Utc;
use uuid::Uuid;

use super::event::{DomainEvent, Event, Payload, PayloadError};
use super::ids::{AggregateType, EventType, ModelError};

// ============================================================================
// Aggregate Root - identity, version and pending events
// ============================================================================
//
// Versions are zero-based. `version` counts the events replayed from the
// store; the next appended event is stamped `version + pending.len()`.
// Pending events are handed out exactly once by `take_events`, and the
// caller must persist them before dropping the aggregate.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct AggregateRoot {
    aggregate_type: AggregateType,
    id: Uuid,
    version: u64,
    pending: Vec<Event>,
}

impl AggregateRoot {
    pub fn new(aggregate_type: AggregateType, id: Uuid) -> Self {
        Self {
            aggregate_type,
            id,
            version: 0,
            pending: Vec::new(),
        }
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of persisted events this aggregate has been rebuilt from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn next_version(&self) -> u64 {
        self.version + self.pending.len() as u64
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Stamp and buffer a new event.
    pub fn append_event(&mut self, event_type: EventType, data: Payload) -> &Event {
        let event = Event::new(
            event_type,
            data,
            Utc::now(),
            self.aggregate_type.clone(),
            self.id,
            self.next_version(),
        );
        self.pending.push(event);
        &self.pending[self.pending.len() - 1]
    }

    /// Drain the buffered events. A second call returns an empty list.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending)
    }

    /// Account for one historical event during replay.
    fn replayed<E>(&mut self, event: &Event) -> Result<(), AggregateError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if event.aggregate_id() != self.id || event.aggregate_type() != &self.aggregate_type {
            return Err(AggregateError::ForeignEvent {
                expected: self.id,
                actual: event.aggregate_id(),
            });
        }
        if event.aggregate_version() != self.version {
            return Err(AggregateError::OutOfOrder {
                aggregate_id: self.id,
                expected: self.version,
                actual: event.aggregate_version(),
            });
        }
        self.version += 1;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AggregateError<E: std::error::Error + Send + Sync + 'static> {
    /// Business rule rejected the command or an event could not be applied.
    #[error(transparent)]
    Domain(E),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("event version {actual} out of order for aggregate {aggregate_id}: expected {expected}")]
    OutOfOrder {
        aggregate_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("event for aggregate {actual} replayed into aggregate {expected}")]
    ForeignEvent { expected: Uuid, actual: Uuid },
}

// ============================================================================
// Aggregate Trait
// ============================================================================

/// An event-sourced consistency boundary.
///
/// State is only ever changed by `apply_event`; `handle_command` validates a
/// command against the current state and returns the events to record.
pub trait Aggregate: Sized + Send + Sync {
    type Event: DomainEvent;
    type Command: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    const AGGREGATE_TYPE: &'static str;

    /// Fresh, empty aggregate around the given root.
    fn from_root(root: AggregateRoot) -> Self;

    fn root(&self) -> &AggregateRoot;

    fn root_mut(&mut self) -> &mut AggregateRoot;

    fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error>;

    fn handle_command(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    fn aggregate_type() -> Result<AggregateType, ModelError> {
        AggregateType::new(Self::AGGREGATE_TYPE)
    }

    fn new(id: Uuid) -> Result<Self, ModelError> {
        Ok(Self::from_root(AggregateRoot::new(Self::aggregate_type()?, id)))
    }

    /// Apply an event to the in-memory state and buffer it for saving.
    fn record(&mut self, event: Self::Event) -> Result<(), AggregateError<Self::Error>> {
        self.apply_event(&event).map_err(AggregateError::Domain)?;
        let event_type = EventType::new(event.event_type())?;
        let data = Payload::encode(event_type.as_str(), &event)?;
        self.root_mut().append_event(event_type, data);
        Ok(())
    }

    /// Run a command and record every event it produces.
    fn execute(&mut self, command: &Self::Command) -> Result<(), AggregateError<Self::Error>> {
        let events = self.handle_command(command).map_err(AggregateError::Domain)?;
        for event in events {
            self.record(event)?;
        }
        Ok(())
    }

    /// Rebuild an aggregate from its history in ascending version order.
    fn load_from_events(id: Uuid, events: &[Event]) -> Result<Self, AggregateError<Self::Error>> {
        let mut aggregate = Self::new(id)?;
        for event in events {
            let typed: Self::Event = event.decode()?;
            aggregate.apply_event(&typed).map_err(AggregateError::Domain)?;
            aggregate.root_mut().replayed::<Self::Error>(event)?;
        }
        Ok(aggregate)
    }
}
