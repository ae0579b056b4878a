use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::{AggregateType, EventType};

// ============================================================================
// Payload Envelope - opaque, type-tagged bytes
// ============================================================================
//
// Events and commands carry their data as a self-describing envelope: a
// type URL plus the encoded bytes. The runtime never looks inside; typed
// code decodes it once at the boundary.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to encode payload {type_url}: {source}")]
    Encode {
        type_url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode payload {type_url}: {source}")]
    Decode {
        type_url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub type_url: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl Payload {
    pub fn new(type_url: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }

    /// Encode a typed value as JSON under the given type URL.
    pub fn encode<T: Serialize>(type_url: impl Into<String>, value: &T) -> Result<Self, PayloadError> {
        let type_url = type_url.into();
        let value = serde_json::to_vec(value).map_err(|source| PayloadError::Encode {
            type_url: type_url.clone(),
            source,
        })?;
        Ok(Self { type_url, value })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_slice(&self.value).map_err(|source| PayloadError::Decode {
            type_url: self.type_url.clone(),
            source,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Event - immutable fact about one aggregate
// ============================================================================

/// A persisted (or about to be persisted) change to an aggregate.
///
/// `(aggregate_type, aggregate_id, aggregate_version)` is unique once the
/// event has been accepted by a store. Fields are read-only after
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_type: EventType,
    data: Payload,
    timestamp: DateTime<Utc>,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
    aggregate_version: u64,
}

impl Event {
    /// Rebuild an event from its stored or transported parts.
    ///
    /// New events are produced by [`AggregateRoot::append_event`]; this
    /// constructor exists for store backends and wire codecs.
    ///
    /// [`AggregateRoot::append_event`]: super::aggregate::AggregateRoot::append_event
    pub fn new(
        event_type: EventType,
        data: Payload,
        timestamp: DateTime<Utc>,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
        aggregate_version: u64,
    ) -> Self {
        Self {
            event_type,
            data,
            timestamp,
            aggregate_type,
            aggregate_id,
            aggregate_version,
        }
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.aggregate_id
    }

    pub fn aggregate_version(&self) -> u64 {
        self.aggregate_version
    }

    /// Decode the payload into the aggregate's typed event.
    pub fn decode<E: DomainEvent>(&self) -> Result<E, PayloadError> {
        self.data.decode()
    }
}

// ============================================================================
// Domain Event Trait
// ============================================================================

/// Typed event data owned by one aggregate.
///
/// Implemented by each aggregate's event enum; `event_type` names the
/// variant so it can be routed without decoding the payload.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn event_type(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct TestEvent {
        data: String,
    }

    impl DomainEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            "TestEvent"
        }
    }

    #[test]
    fn test_payload_carries_type_url() {
        let payload = Payload::encode("TestEvent", &TestEvent { data: "x".into() }).unwrap();
        assert_eq!(payload.type_url, "TestEvent");
        assert!(!payload.is_empty());

        let decoded: TestEvent = payload.decode().unwrap();
        assert_eq!(decoded.data, "x");
    }

    #[test]
    fn test_payload_decode_error_names_type() {
        let payload = Payload::new("Broken", b"not json".to_vec());
        let err = payload.decode::<TestEvent>().unwrap_err();
        assert!(err.to_string().contains("Broken"));
    }

    #[test]
    fn test_payload_bytes_serialize_as_base64() {
        let payload = Payload::new("Raw", vec![0, 1, 2, 255]);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["typeUrl"], "Raw");
        assert_eq!(json["value"], "AAEC/w==");

        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_event_exposes_identity() {
        let id = Uuid::new_v4();
        let event = Event::new(
            EventType::new("TestEvent").unwrap(),
            Payload::encode("TestEvent", &TestEvent { data: "d".into() }).unwrap(),
            Utc::now(),
            AggregateType::new("Test").unwrap(),
            id,
            4,
        );

        assert_eq!(event.aggregate_id(), id);
        assert_eq!(event.aggregate_version(), 4);
        assert_eq!(event.aggregate_type(), "Test");
        assert_eq!(event.decode::<TestEvent>().unwrap().data, "d");
    }
}
