use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers - opaque, non-empty type names
// ============================================================================
//
// Aggregate, event and command types are plain strings on the wire. The
// only rule they carry is that the empty string is never a valid name.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("{0} cannot be empty")]
    EmptyIdentifier(&'static str),
}

macro_rules! define_type_name {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, ModelError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(ModelError::EmptyIdentifier($label));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ModelError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ModelError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

define_type_name!(
    /// Name of an aggregate kind, e.g. `User` or `Cluster`.
    AggregateType,
    "aggregate type"
);

define_type_name!(
    /// Name of an event kind, e.g. `UserCreated`.
    EventType,
    "event type"
);

define_type_name!(
    /// Name of a command kind, e.g. `CreateUser`.
    CommandType,
    "command type"
);
