use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::broker::{BrokerChannel, Confirmation};
use super::connection::ChannelManager;
use super::errors::{BrokerError, BusError};
use super::routing::routing_key;
use super::wire;
use crate::event_sourcing::Event;
use crate::metrics::Metrics;
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};

// ============================================================================
// Event Publisher - confirmed delivery with bounded resends
// ============================================================================
//
// Every publish waits for the broker's confirm. A nack or a failed send is
// retried after `resend_delay`, for at most `max_resends` extra attempts.
// Waiting races the caller's deadline and bus shutdown; whichever fires
// first decides the outcome. Flow control fails the attempt immediately.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub routing_key_prefix: String,
    /// Extra attempts after the first one
    pub max_resends: u32,
    pub resend_delay: Duration,
    /// Deadline applied by `publish_event`
    pub publish_timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: "cluster.events".to_string(),
            routing_key_prefix: "events".to_string(),
            max_resends: 3,
            resend_delay: Duration::from_millis(250),
            publish_timeout: Duration::from_secs(10),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

pub struct EventPublisher {
    connection: Arc<ChannelManager>,
    config: PublisherConfig,
    breaker: CircuitBreaker,
    /// Channel generation the exchange was last declared on
    declared: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl EventPublisher {
    pub fn new(connection: Arc<ChannelManager>, config: PublisherConfig, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            breaker: CircuitBreaker::new(config.circuit_breaker.clone(), metrics.clone()),
            connection,
            config,
            declared: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn connection(&self) -> &Arc<ChannelManager> {
        &self.connection
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Publish with the configured `publish_timeout` as deadline.
    pub async fn publish_event(&self, event: &Event) -> Result<(), BusError> {
        self.publish_event_until(event, Instant::now() + self.config.publish_timeout)
            .await
    }

    /// Publish and wait for confirmation until `deadline`. Dropping the
    /// returned future abandons the publish.
    pub async fn publish_event_until(&self, event: &Event, deadline: Instant) -> Result<(), BusError> {
        let body = wire::encode(event)?;
        let key = routing_key(
            &self.config.routing_key_prefix,
            event.aggregate_type(),
            event.event_type(),
        );

        let outcome = tokio::select! {
            biased;
            _ = self.connection.wait_shutdown() => Err(BusError::Shutdown),
            _ = tokio::time::sleep_until(deadline) => Err(BusError::ContextDeadlineExceeded),
            result = self.breaker.call(self.send_with_resends(event, &key, &body)) => match result {
                Ok(()) => Ok(()),
                Err(CircuitBreakerError::CircuitOpen) => Err(BusError::CircuitOpen),
                Err(CircuitBreakerError::OperationFailed(e)) => Err(e),
            },
        };

        match &outcome {
            Ok(()) => {
                tracing::debug!(routing_key = %key, version = event.aggregate_version(), "Event published");
                if let Some(metrics) = &self.metrics {
                    metrics.record_published(event.event_type().as_str());
                }
            }
            Err(e) => {
                tracing::error!(routing_key = %key, error = %e, "Failed to publish event");
                if let Some(metrics) = &self.metrics {
                    metrics.record_publish_failure(failure_reason(e));
                }
            }
        }
        outcome
    }

    async fn send_with_resends(&self, event: &Event, key: &str, body: &[u8]) -> Result<(), BusError> {
        let attempts_allowed = self.config.max_resends.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.attempt(key, body).await {
                Ok(Confirmation::Ack) => return Ok(()),
                Ok(Confirmation::Nack) => {
                    tracing::warn!(routing_key = %key, attempt = attempt, "Broker nacked publish");
                }
                Err(BusError::FlowControl) => return Err(BusError::FlowControl),
                Err(e) => {
                    tracing::warn!(routing_key = %key, attempt = attempt, error = %e, "Publish attempt failed");
                }
            }

            if attempt >= attempts_allowed {
                return Err(BusError::CouldNotPublishEvent {
                    event_type: event.event_type().to_string(),
                    attempts: attempt,
                });
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_publish_resend(event.event_type().as_str());
            }
            tokio::time::sleep(self.config.resend_delay).await;
        }
    }

    async fn attempt(&self, key: &str, body: &[u8]) -> Result<Confirmation, BusError> {
        let (channel, generation) = self.connection.current().await?;
        if channel.is_flow_blocked() {
            return Err(BusError::FlowControl);
        }
        self.ensure_exchange(channel.as_ref(), generation).await?;

        let confirm = channel
            .publish(&self.config.exchange, key, body.to_vec())
            .await?;
        confirm
            .await
            .map_err(|_| BusError::Broker(BrokerError::ChannelClosed))
    }

    async fn ensure_exchange(&self, channel: &dyn BrokerChannel, generation: u64) -> Result<(), BusError> {
        if self.declared.load(Ordering::SeqCst) == generation {
            return Ok(());
        }
        channel.declare_exchange(&self.config.exchange).await?;
        self.declared.store(generation, Ordering::SeqCst);
        Ok(())
    }
}

fn failure_reason(error: &BusError) -> &'static str {
    match error {
        BusError::Shutdown => "shutdown",
        BusError::ContextDeadlineExceeded => "deadline",
        BusError::FlowControl => "flow_control",
        BusError::CircuitOpen => "circuit_open",
        BusError::CouldNotPublishEvent { .. } => "resends_exhausted",
        _ => "other",
    }
}
