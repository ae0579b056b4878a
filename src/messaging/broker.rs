use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use super::errors::BrokerError;

// ============================================================================
// Broker Contract
// ============================================================================
//
// The subset of an AMQP-style broker the bus relies on: topic exchanges,
// wildcard bindings, publisher confirms and consumer ack/nack. A network
// client implements these traits outside this crate; `MemoryBroker` is the
// in-process implementation.
//
// ============================================================================

/// Broker verdict on one published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Only the declaring channel may consume; deleted when it closes.
    pub exclusive: bool,
    /// Deleted once its consumer goes away.
    pub auto_delete: bool,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a fresh connection and channel.
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Publish in confirm mode. The receiver resolves once the broker acks
    /// or nacks the message, and errors if the channel dies first.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<oneshot::Receiver<Confirmation>, BrokerError>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError>;

    /// Start consuming. The stream ends when the channel closes.
    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Whether the broker currently asks publishers to hold off.
    fn is_flow_blocked(&self) -> bool;

    /// Flips to `true` when the channel is closed, by either side.
    fn closed(&self) -> watch::Receiver<bool>;

    async fn close(&self);
}
