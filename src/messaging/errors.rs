use crate::utils::IsTransient;

/// Failures reported by a broker connection or channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker refused the connection")]
    ConnectionRefused,

    #[error("broker channel is closed")]
    ChannelClosed,

    #[error("exchange {0} does not exist")]
    NoSuchExchange(String),

    #[error("queue {0} does not exist")]
    NoSuchQueue(String),

    #[error("queue {0} is locked by another connection")]
    ResourceLocked(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message bus is not connected")]
    MessageNotConnected,

    #[error("message bus connection failed: {0}")]
    MessageBusConnection(String),

    #[error("could not publish {event_type} after {attempts} attempts")]
    CouldNotPublishEvent { event_type: String, attempts: u32 },

    #[error("could not add handler for {pattern}: {reason}")]
    CouldNotAddHandler { pattern: String, reason: String },

    #[error("context deadline exceeded")]
    ContextDeadlineExceeded,

    #[error("message bus is shutting down")]
    Shutdown,

    #[error("broker applied flow control")]
    FlowControl,

    #[error("publisher circuit breaker is open")]
    CircuitOpen,

    #[error("event codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl IsTransient for BusError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::MessageNotConnected
                | BusError::MessageBusConnection(_)
                | BusError::CouldNotPublishEvent { .. }
                | BusError::FlowControl
                | BusError::Broker(_)
        )
    }
}
