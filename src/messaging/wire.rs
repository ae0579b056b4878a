use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::BusError;
use crate::event_sourcing::{AggregateType, Event, EventType, Payload};

/// Bus message body. The payload envelope travels untouched with its bytes
/// base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub event_type: EventType,
    pub data: Payload,
    pub timestamp: DateTime<Utc>,
    pub aggregate_type: AggregateType,
    pub aggregate_id: Uuid,
    pub aggregate_version: u64,
}

impl From<&Event> for WireEvent {
    fn from(event: &Event) -> Self {
        Self {
            event_type: event.event_type().clone(),
            data: event.data().clone(),
            timestamp: event.timestamp(),
            aggregate_type: event.aggregate_type().clone(),
            aggregate_id: event.aggregate_id(),
            aggregate_version: event.aggregate_version(),
        }
    }
}

impl From<WireEvent> for Event {
    fn from(wire: WireEvent) -> Self {
        Event::new(
            wire.event_type,
            wire.data,
            wire.timestamp,
            wire.aggregate_type,
            wire.aggregate_id,
            wire.aggregate_version,
        )
    }
}

pub fn encode(event: &Event) -> Result<Vec<u8>, BusError> {
    Ok(serde_json::to_vec(&WireEvent::from(event))?)
}

pub fn decode(body: &[u8]) -> Result<Event, BusError> {
    let wire: WireEvent = serde_json::from_slice(body)?;
    Ok(wire.into())
}
