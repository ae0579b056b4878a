use std::sync::Arc;

use async_trait::async_trait;

use super::broker::Broker;
use super::connection::ChannelManager;
use super::consumer::{ConsumerConfig, EventConsumer};
use super::errors::BusError;
use super::publisher::{EventPublisher, PublisherConfig};
use super::routing::Matcher;
use crate::event_sourcing::Event;
use crate::metrics::Metrics;
use crate::projection::EventHandler;
use crate::utils::RetryConfig;

/// Publish/subscribe transport for persisted events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_event(&self, event: &Event) -> Result<(), BusError>;

    /// Deliver every event selected by any of `matchers` to `handler`.
    async fn add_handler(&self, handler: Arc<dyn EventHandler>, matchers: &[Matcher]) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
    /// Backoff for connecting and reconnecting both connections
    pub reconnect: RetryConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            publisher: PublisherConfig::default(),
            consumer: ConsumerConfig::default(),
            reconnect: RetryConfig::reconnect(std::time::Duration::from_secs(60)),
        }
    }
}

/// Event bus over a topic-routing broker. Publishing and consuming use
/// separate connections so back-pressure on one does not stall the other.
pub struct BrokerEventBus {
    publisher: EventPublisher,
    consumer: EventConsumer,
}

impl BrokerEventBus {
    pub async fn connect(
        broker: Arc<dyn Broker>,
        config: BusConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, BusError> {
        let publish_connection =
            ChannelManager::connect("publisher", broker.clone(), config.reconnect.clone(), metrics.clone()).await?;
        let consume_connection =
            match ChannelManager::connect("consumer", broker, config.reconnect.clone(), metrics.clone()).await {
                Ok(connection) => connection,
                Err(e) => {
                    publish_connection.close().await;
                    return Err(e);
                }
            };

        Ok(Self {
            publisher: EventPublisher::new(publish_connection, config.publisher, metrics.clone()),
            consumer: EventConsumer::new(consume_connection, config.consumer, metrics),
        })
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn consumer(&self) -> &EventConsumer {
        &self.consumer
    }
}

#[async_trait]
impl EventBus for BrokerEventBus {
    async fn publish_event(&self, event: &Event) -> Result<(), BusError> {
        self.publisher.publish_event(event).await
    }

    async fn add_handler(&self, handler: Arc<dyn EventHandler>, matchers: &[Matcher]) -> Result<(), BusError> {
        self.consumer.add_handler(handler, matchers).await
    }

    /// Drain consumers first, then drop both connections.
    async fn close(&self) -> Result<(), BusError> {
        self.consumer.close().await;
        self.consumer.connection().close().await;
        self.publisher.connection().close().await;
        Ok(())
    }
}
