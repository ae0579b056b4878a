use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::broker::{BrokerChannel, Delivery, QueueOptions};
use super::connection::{signalled, ChannelManager};
use super::errors::BusError;
use super::routing::Matcher;
use super::wire;
use crate::metrics::Metrics;
use crate::projection::EventHandler;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Event Consumer - matcher subscriptions with ack/nack
// ============================================================================
//
// Each matcher gets its own exclusive, auto-delete queue bound to the
// matcher's routing pattern, and `concurrency` workers pulling from it.
// A handled event is acked; a handler error nacks with requeue so the
// broker redelivers it. Bodies that do not decode are rejected without
// requeue.
//
// The queue dies with its channel. After a reconnect the subscription
// declares and binds a fresh queue on the new channel.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub exchange: String,
    pub routing_key_prefix: String,
    /// Queue names are `{queue_prefix}.{uuid}`
    pub queue_prefix: String,
    /// Workers per subscription
    pub concurrency: usize,
    /// Backoff for queue/bind/consume setup
    pub setup_retry: RetryConfig,
    /// How long `close` waits for in-flight deliveries
    pub drain_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            exchange: "cluster.events".to_string(),
            routing_key_prefix: "events".to_string(),
            queue_prefix: "cluster-events".to_string(),
            concurrency: 4,
            setup_retry: RetryConfig::aggressive(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct Subscription {
    queue: String,
    pattern: String,
    matcher: Matcher,
    handler: Arc<dyn EventHandler>,
}

type DeliveryStream = Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>;

struct Shared {
    connection: Arc<ChannelManager>,
    config: ConsumerConfig,
    stopping: watch::Sender<bool>,
    metrics: Option<Arc<Metrics>>,
}

pub struct EventConsumer {
    shared: Arc<Shared>,
    subscriptions: Mutex<JoinSet<()>>,
}

impl EventConsumer {
    pub fn new(connection: Arc<ChannelManager>, config: ConsumerConfig, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                connection,
                config,
                stopping: watch::Sender::new(false),
                metrics,
            }),
            subscriptions: Mutex::new(JoinSet::new()),
        }
    }

    pub fn connection(&self) -> &Arc<ChannelManager> {
        &self.shared.connection
    }

    /// Subscribe `handler` once per matcher. Setup is retried with backoff;
    /// a `Never` matcher is skipped.
    pub async fn add_handler(&self, handler: Arc<dyn EventHandler>, matchers: &[Matcher]) -> Result<(), BusError> {
        if self.shared.is_stopping() {
            return Err(BusError::Shutdown);
        }

        for matcher in matchers {
            let Some(pattern) = matcher.routing_pattern(&self.shared.config.routing_key_prefix) else {
                tracing::warn!("Skipping subscription for a matcher that never matches");
                continue;
            };

            let subscription = Subscription {
                queue: format!("{}.{}", self.shared.config.queue_prefix, Uuid::new_v4()),
                pattern,
                matcher: matcher.clone(),
                handler: handler.clone(),
            };

            // subscribe before setup so a reconnect during setup is not missed
            let reconnected = self.shared.connection.notify_reconnect();
            let (channel, deliveries) =
                self.shared
                    .subscribe(&subscription)
                    .await
                    .map_err(|e| BusError::CouldNotAddHandler {
                        pattern: subscription.pattern.clone(),
                        reason: e.to_string(),
                    })?;

            tracing::info!(
                queue = %subscription.queue,
                pattern = %subscription.pattern,
                concurrency = self.shared.config.concurrency,
                "Event handler subscribed"
            );

            let shared = self.shared.clone();
            self.subscriptions
                .lock()
                .await
                .spawn(shared.supervise(subscription, channel, deliveries, reconnected));
        }
        Ok(())
    }

    /// Stop taking deliveries, let in-flight ones finish and settle, then
    /// return. Workers still busy after `drain_timeout` are aborted and their
    /// deliveries are redelivered by the broker.
    pub async fn close(&self) {
        self.shared.stopping.send_replace(true);
        let mut subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);

        let drained = tokio::time::timeout(self.shared.config.drain_timeout, async {
            while subscriptions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!("Consumer drain timed out, aborting remaining workers");
            subscriptions.abort_all();
        }
        tracing::info!("Event consumer closed");
    }
}

impl Shared {
    fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    async fn stopped(&self) {
        signalled(self.stopping.subscribe()).await
    }

    async fn subscribe(
        &self,
        subscription: &Subscription,
    ) -> Result<(Arc<dyn BrokerChannel>, mpsc::UnboundedReceiver<Delivery>), BusError> {
        let connection = &self.connection;
        let exchange = self.config.exchange.as_str();
        let result = retry_on_transient(self.config.setup_retry.clone(), move |_attempt| async move {
            let channel = connection.channel().await?;
            channel.declare_exchange(exchange).await?;
            channel
                .declare_queue(
                    &subscription.queue,
                    QueueOptions {
                        exclusive: true,
                        auto_delete: true,
                    },
                )
                .await?;
            channel
                .bind_queue(&subscription.queue, exchange, &subscription.pattern)
                .await?;
            let deliveries = channel.consume(&subscription.queue).await?;
            Ok::<_, BusError>((channel, deliveries))
        })
        .await;

        match result {
            RetryResult::Success(subscribed) => Ok(subscribed),
            RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => Err(e),
        }
    }

    /// Run workers for one subscription until the consumer stops, and
    /// resubscribe whenever the connection comes back.
    async fn supervise(
        self: Arc<Self>,
        subscription: Subscription,
        mut channel: Arc<dyn BrokerChannel>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        mut reconnected: broadcast::Receiver<u64>,
    ) {
        loop {
            let stream: DeliveryStream = Arc::new(Mutex::new(deliveries));
            let mut workers = JoinSet::new();
            for worker in 0..self.config.concurrency.max(1) {
                workers.spawn(self.clone().work(worker, subscription.clone(), channel.clone(), stream.clone()));
            }
            while workers.join_next().await.is_some() {}

            if self.is_stopping() {
                return;
            }
            tracing::warn!(queue = %subscription.queue, "Delivery stream ended, waiting for reconnect");

            loop {
                tokio::select! {
                    biased;
                    _ = self.stopped() => return,
                    _ = self.connection.wait_shutdown() => return,
                    notice = reconnected.recv() => match notice {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }

                // notices queued before this point are covered by the setup below
                reconnected = reconnected.resubscribe();
                match self.subscribe(&subscription).await {
                    Ok((next_channel, next_deliveries)) => {
                        channel = next_channel;
                        deliveries = next_deliveries;
                        tracing::info!(
                            queue = %subscription.queue,
                            pattern = %subscription.pattern,
                            "Subscription restored after reconnect"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::error!(queue = %subscription.queue, error = %e, "Resubscribe failed");
                    }
                }
            }
        }
    }

    async fn work(
        self: Arc<Self>,
        worker: usize,
        subscription: Subscription,
        channel: Arc<dyn BrokerChannel>,
        stream: DeliveryStream,
    ) {
        loop {
            let next = {
                let mut deliveries = stream.lock().await;
                tokio::select! {
                    biased;
                    _ = self.stopped() => None,
                    delivery = deliveries.recv() => delivery,
                }
            };
            let Some(delivery) = next else {
                tracing::debug!(queue = %subscription.queue, worker = worker, "Worker stopped");
                return;
            };
            self.process(&subscription, channel.as_ref(), delivery).await;
        }
    }

    async fn process(&self, subscription: &Subscription, channel: &dyn BrokerChannel, delivery: Delivery) {
        let tag = delivery.delivery_tag;

        let event = match wire::decode(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(routing_key = %delivery.routing_key, error = %e, "Rejecting undecodable delivery");
                self.settle(channel.nack(tag, false).await, "reject");
                return;
            }
        };

        if !subscription.matcher.matches(&event) {
            tracing::debug!(routing_key = %delivery.routing_key, "Delivery outside matcher, dropping");
            self.settle(channel.ack(tag).await, "ack");
            return;
        }

        match subscription.handler.handle_event(&event).await {
            Ok(()) => self.settle(channel.ack(tag).await, "ack"),
            Err(e) => {
                tracing::warn!(
                    event_type = %event.event_type(),
                    aggregate_id = %event.aggregate_id(),
                    version = event.aggregate_version(),
                    redelivered = delivery.redelivered,
                    error = %e,
                    "Event handler failed, requeueing"
                );
                self.settle(channel.nack(tag, true).await, "nack");
            }
        }
    }

    fn settle(&self, result: Result<(), super::errors::BrokerError>, outcome: &str) {
        match result {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_delivery(outcome);
                }
            }
            // the broker requeues unsettled deliveries when the channel closes
            Err(e) => tracing::debug!(outcome = outcome, error = %e, "Could not settle delivery"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::{AggregateType, Event, EventType, Payload};
    use crate::messaging::{Broker, EventPublisher, MemoryBroker, PublisherConfig};
    use crate::projection::ProjectionError;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records event types; fails the first `failures` calls.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: &Event) -> Result<(), ProjectionError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ProjectionError::Other(anyhow::anyhow!("not yet")));
            }
            self.seen.lock().await.push(event.event_type().to_string());
            Ok(())
        }
    }

    impl Recorder {
        async fn wait_for(&self, count: usize) -> Vec<String> {
            tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    let seen = self.seen.lock().await.clone();
                    if seen.len() >= count {
                        return seen;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("events not delivered")
        }
    }

    fn event(aggregate_type: &str, event_type: &str) -> Event {
        Event::new(
            EventType::new(event_type).unwrap(),
            Payload::new(event_type, b"{}".to_vec()),
            Utc::now(),
            AggregateType::new(aggregate_type).unwrap(),
            Uuid::new_v4(),
            0,
        )
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 50,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_elapsed: None,
        }
    }

    async fn harness(broker: &MemoryBroker, metrics: Option<Arc<Metrics>>) -> (EventPublisher, EventConsumer) {
        let publish = ChannelManager::connect("publisher", Arc::new(broker.clone()), retry(), None)
            .await
            .unwrap();
        let consume = ChannelManager::connect("consumer", Arc::new(broker.clone()), retry(), None)
            .await
            .unwrap();
        let publisher = EventPublisher::new(
            publish,
            PublisherConfig {
                resend_delay: Duration::from_millis(20),
                max_resends: 10,
                ..PublisherConfig::default()
            },
            None,
        );
        let consumer = EventConsumer::new(
            consume,
            ConsumerConfig {
                concurrency: 2,
                setup_retry: retry(),
                ..ConsumerConfig::default()
            },
            metrics,
        );
        (publisher, consumer)
    }

    #[tokio::test]
    async fn test_matcher_filters_deliveries() {
        let broker = MemoryBroker::new();
        let (publisher, consumer) = harness(&broker, None).await;
        let recorder = Arc::new(Recorder::default());
        consumer
            .add_handler(recorder.clone(), &[Matcher::aggregate_type(AggregateType::new("User").unwrap())])
            .await
            .unwrap();

        publisher.publish_event(&event("Team", "TeamCreated")).await.unwrap();
        publisher.publish_event(&event("User", "UserCreated")).await.unwrap();

        assert_eq!(recorder.wait_for(1).await, vec!["UserCreated"]);
        consumer.close().await;
        assert_eq!(recorder.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_never_matcher_creates_no_queue() {
        let broker = MemoryBroker::new();
        let (_publisher, consumer) = harness(&broker, None).await;

        consumer
            .add_handler(Arc::new(Recorder::default()), &[Matcher::default()])
            .await
            .unwrap();

        assert_eq!(broker.queue_count().await, 0);
    }

    #[tokio::test]
    async fn test_handler_error_nacks_and_redelivers() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let (publisher, consumer) = harness(&broker, Some(metrics.clone())).await;
        let recorder = Arc::new(Recorder {
            failures: AtomicU32::new(2),
            ..Recorder::default()
        });
        consumer.add_handler(recorder.clone(), &[Matcher::any()]).await.unwrap();

        publisher.publish_event(&event("User", "UserCreated")).await.unwrap();

        assert_eq!(recorder.wait_for(1).await, vec!["UserCreated"]);
        consumer.close().await;
        assert_eq!(metrics.deliveries.with_label_values(&["nack"]).get(), 2);
        assert_eq!(metrics.deliveries.with_label_values(&["ack"]).get(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_delivery_is_rejected() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let (_publisher, consumer) = harness(&broker, Some(metrics.clone())).await;
        let recorder = Arc::new(Recorder::default());
        consumer.add_handler(recorder.clone(), &[Matcher::any()]).await.unwrap();

        let raw = broker.connect().await.unwrap();
        raw.publish("cluster.events", "events.User.Garbage", b"not json".to_vec())
            .await
            .unwrap()
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while metrics.deliveries.with_label_values(&["reject"]).get() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(recorder.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_resubscribes_after_reconnect() {
        let broker = MemoryBroker::new();
        let (publisher, consumer) = harness(&broker, None).await;
        let recorder = Arc::new(Recorder::default());
        consumer.add_handler(recorder.clone(), &[Matcher::any()]).await.unwrap();
        publisher.publish_event(&event("User", "UserCreated")).await.unwrap();
        recorder.wait_for(1).await;

        broker.drop_connections().await;

        // the fresh queue may not be bound yet; keep publishing until one lands
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                publisher.publish_event(&event("User", "UserRenamed")).await.unwrap();
                if recorder.seen.lock().await.iter().any(|t| t == "UserRenamed") {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        consumer.close().await;
    }

    #[tokio::test]
    async fn test_add_handler_after_close_fails() {
        let broker = MemoryBroker::new();
        let (_publisher, consumer) = harness(&broker, None).await;
        consumer.close().await;

        let result = consumer.add_handler(Arc::new(Recorder::default()), &[Matcher::any()]).await;
        assert!(matches!(result, Err(BusError::Shutdown)));
    }
}
