use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use super::broker::{Broker, BrokerChannel, Confirmation, Delivery, QueueOptions};
use super::errors::BrokerError;
use super::routing::topic_matches;

// ============================================================================
// In-Memory Broker
// ============================================================================
//
// Topic exchanges, exclusive/auto-delete queues, confirms and ack/nack,
// all in process. Tests script failures through the control methods:
// refused connects, nacked publishes, flow control and dropped connections.
//
// ============================================================================

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Queue {
    options: QueueOptions,
    owner: u64,
    ready: VecDeque<Message>,
    consumer: Option<(u64, mpsc::UnboundedSender<Delivery>)>,
    unacked: HashMap<u64, Message>,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    next_channel: u64,
    next_tag: u64,
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    tag_index: HashMap<u64, String>,
    channels: HashMap<u64, watch::Sender<bool>>,
    refuse_connects: u32,
    nack_publishes: u32,
    published: usize,
}

impl BrokerState {
    /// Push ready messages to the queue's consumer, if any.
    fn dispatch(&mut self, name: &str) {
        let BrokerState {
            queues,
            tag_index,
            next_tag,
            ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        loop {
            let Some(sender) = queue.consumer.as_ref().map(|(_, tx)| tx.clone()) else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            *next_tag += 1;
            let tag = *next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
            };
            if sender.send(delivery).is_err() {
                queue.ready.push_front(message);
                queue.consumer = None;
                break;
            }
            queue.unacked.insert(tag, message);
            tag_index.insert(tag, name.to_string());
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8]) {
        let targets: HashSet<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(Message {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
            self.dispatch(&name);
        }
    }

    fn close_channel(&mut self, channel: u64) {
        let Some(closed) = self.channels.remove(&channel) else {
            return;
        };
        let _ = closed.send(true);

        let mut doomed = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let consumed_here = queue.consumer.as_ref().is_some_and(|(id, _)| *id == channel);
            if consumed_here {
                queue.consumer = None;
                let mut returned: Vec<(u64, Message)> = queue.unacked.drain().collect();
                returned.sort_by_key(|(tag, _)| *tag);
                for (tag, mut message) in returned.into_iter().rev() {
                    self.tag_index.remove(&tag);
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            let owned_exclusive = queue.options.exclusive && queue.owner == channel;
            if owned_exclusive || (queue.options.auto_delete && consumed_here) {
                doomed.push(name.clone());
            }
        }

        for name in doomed {
            self.queues.remove(&name);
            self.bindings.retain(|b| b.queue != name);
            self.tag_index.retain(|_, queue| *queue != name);
        }
    }
}

/// Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    flow_blocked: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts.
    pub async fn refuse_connections(&self, count: u32) {
        self.state.lock().await.refuse_connects = count;
    }

    /// Nack the next `count` publishes without routing them.
    pub async fn nack_next_publishes(&self, count: u32) {
        self.state.lock().await.nack_publishes = count;
    }

    pub fn set_flow_blocked(&self, blocked: bool) {
        self.flow_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Close every open channel as if the connection had dropped.
    pub async fn drop_connections(&self) {
        let mut state = self.state.lock().await;
        let open: Vec<u64> = state.channels.keys().copied().collect();
        for channel in open {
            state.close_channel(channel);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.channels.len()
    }

    /// Messages acked and routed so far.
    pub async fn published_count(&self) -> usize {
        self.state.lock().await.published
    }

    pub async fn queue_count(&self) -> usize {
        self.state.lock().await.queues.len()
    }

    /// Ready plus unacknowledged messages, or `None` if the queue is gone.
    pub async fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.ready.len() + q.unacked.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.state.lock().await;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BrokerError::ConnectionRefused);
        }

        state.next_channel += 1;
        let id = state.next_channel;
        let (closed_tx, closed_rx) = watch::channel(false);
        state.channels.insert(id, closed_tx);

        Ok(Arc::new(MemoryChannel {
            id,
            state: self.state.clone(),
            flow_blocked: self.flow_blocked.clone(),
            closed: closed_rx,
        }))
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    flow_blocked: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
}

impl MemoryChannel {
    async fn open_state(&self) -> Result<tokio::sync::MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.state.lock().await;
        if !state.channels.contains_key(&self.id) {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.open_state().await?.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<oneshot::Receiver<Confirmation>, BrokerError> {
        let mut state = self.open_state().await?;
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::NoSuchExchange(exchange.to_string()));
        }

        let (confirm_tx, confirm_rx) = oneshot::channel();
        if state.nack_publishes > 0 {
            state.nack_publishes -= 1;
            let _ = confirm_tx.send(Confirmation::Nack);
            return Ok(confirm_rx);
        }

        state.route(exchange, routing_key, &body);
        state.published += 1;
        let _ = confirm_tx.send(Confirmation::Ack);
        Ok(confirm_rx)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.open_state().await?;
        if let Some(existing) = state.queues.get(name) {
            if existing.options.exclusive && existing.owner != self.id {
                return Err(BrokerError::ResourceLocked(name.to_string()));
            }
            return Ok(());
        }
        state.queues.insert(
            name.to_string(),
            Queue {
                options,
                owner: self.id,
                ready: VecDeque::new(),
                consumer: None,
                unacked: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        let mut state = self.open_state().await?;
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::NoSuchExchange(exchange.to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NoSuchQueue(queue.to_string()));
        }
        let duplicate = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !duplicate {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let mut state = self.open_state().await?;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NoSuchQueue(queue.to_string()))?;
        if target.options.exclusive && target.owner != self.id {
            return Err(BrokerError::ResourceLocked(queue.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        target.consumer = Some((self.id, tx));
        state.dispatch(queue);
        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.open_state().await?;
        let name = state
            .tag_index
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        if let Some(queue) = state.queues.get_mut(&name) {
            queue.unacked.remove(&delivery_tag);
        }
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.open_state().await?;
        let name = state
            .tag_index
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        let Some(queue) = state.queues.get_mut(&name) else {
            return Ok(());
        };
        if let Some(mut message) = queue.unacked.remove(&delivery_tag) {
            if requeue {
                message.redelivered = true;
                queue.ready.push_back(message);
            }
        }
        state.dispatch(&name);
        Ok(())
    }

    fn is_flow_blocked(&self) -> bool {
        self.flow_blocked.load(Ordering::SeqCst)
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    async fn close(&self) {
        self.state.lock().await.close_channel(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXCHANGE: &str = "cluster.events";

    async fn bound_queue(broker: &MemoryBroker, queue: &str, pattern: &str) -> Arc<dyn BrokerChannel> {
        let channel = broker.connect().await.unwrap();
        channel.declare_exchange(EXCHANGE).await.unwrap();
        channel
            .declare_queue(
                queue,
                QueueOptions {
                    exclusive: true,
                    auto_delete: true,
                },
            )
            .await
            .unwrap();
        channel.bind_queue(queue, EXCHANGE, pattern).await.unwrap();
        channel
    }

    #[tokio::test]
    async fn test_routes_by_pattern_and_confirms() {
        let broker = MemoryBroker::new();
        let consumer = bound_queue(&broker, "users", "events.User.*").await;
        let mut deliveries = consumer.consume("users").await.unwrap();

        let publisher = broker.connect().await.unwrap();
        let confirm = publisher
            .publish(EXCHANGE, "events.User.UserCreated", b"one".to_vec())
            .await
            .unwrap();
        assert_eq!(confirm.await.unwrap(), Confirmation::Ack);
        publisher
            .publish(EXCHANGE, "events.Team.TeamCreated", b"two".to_vec())
            .await
            .unwrap();

        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.body, b"one");
        assert!(deliveries.try_recv().is_err());
        assert_eq!(broker.published_count().await, 2);
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let channel = bound_queue(&broker, "q", "#").await;
        let mut deliveries = channel.consume("q").await.unwrap();
        channel.publish(EXCHANGE, "events.User.X", b"m".to_vec()).await.unwrap();

        let first = deliveries.recv().await.unwrap();
        assert!(!first.redelivered);
        channel.nack(first.delivery_tag, true).await.unwrap();

        let second = deliveries.recv().await.unwrap();
        assert!(second.redelivered);
        channel.ack(second.delivery_tag).await.unwrap();
        assert_eq!(broker.queue_depth("q").await, Some(0));
        assert!(matches!(
            channel.ack(second.delivery_tag).await,
            Err(BrokerError::UnknownDeliveryTag(_))
        ));
    }

    #[tokio::test]
    async fn test_scripted_nacks_are_not_routed() {
        let broker = MemoryBroker::new();
        let channel = bound_queue(&broker, "q", "#").await;
        broker.nack_next_publishes(1).await;

        let nacked = channel.publish(EXCHANGE, "events.User.X", b"m".to_vec()).await.unwrap();
        assert_eq!(nacked.await.unwrap(), Confirmation::Nack);
        assert_eq!(broker.queue_depth("q").await, Some(0));
    }

    #[tokio::test]
    async fn test_exclusive_queue_is_locked_to_its_channel() {
        let broker = MemoryBroker::new();
        let _owner = bound_queue(&broker, "mine", "#").await;
        let other = broker.connect().await.unwrap();

        assert!(matches!(other.consume("mine").await, Err(BrokerError::ResourceLocked(_))));
    }

    #[tokio::test]
    async fn test_dropped_connection_closes_channels_and_queues() {
        let broker = MemoryBroker::new();
        let channel = bound_queue(&broker, "q", "#").await;
        let mut closed = channel.closed();
        broker.refuse_connections(1).await;

        broker.drop_connections().await;

        closed.changed().await.unwrap();
        assert!(*closed.borrow());
        assert_eq!(broker.queue_count().await, 0);
        assert!(matches!(
            channel.declare_exchange(EXCHANGE).await,
            Err(BrokerError::ChannelClosed)
        ));
        assert!(matches!(broker.connect().await, Err(BrokerError::ConnectionRefused)));
        assert!(broker.connect().await.is_ok());
    }
}
