// ============================================================================
// Messaging - reliable event bus over a topic broker
// ============================================================================

mod broker;
mod bus;
mod connection;
mod consumer;
mod errors;
mod memory_broker;
mod publisher;
mod routing;
pub mod wire;

pub use broker::{Broker, BrokerChannel, Confirmation, Delivery, QueueOptions};
pub use bus::{BrokerEventBus, BusConfig, EventBus};
pub use connection::{ChannelManager, ConnectionState};
pub use consumer::{ConsumerConfig, EventConsumer};
pub use errors::{BrokerError, BusError};
pub use memory_broker::MemoryBroker;
pub use publisher::{EventPublisher, PublisherConfig};
pub use routing::{routing_key, topic_matches, Matcher};
