use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};

use super::broker::{Broker, BrokerChannel};
use super::errors::BusError;
use crate::metrics::Metrics;
use crate::utils::{retry_with_backoff, RetryConfig, RetryResult};

// ============================================================================
// Channel Manager - one reconnecting broker connection
// ============================================================================
//
//   Disconnected -> Connecting -> Connected
//   Connected -> Reconnecting          (channel closed by the broker)
//   Reconnecting -> Connected          (new channel established)
//   Reconnecting -> Disconnected       (shutdown, or backoff budget spent)
//
// A background task watches the current channel's close signal and drives
// reconnection with exponential backoff. Publishers and consumers learn
// about a fresh channel through `notify_reconnect`, which carries the new
// generation number. Only `close` makes Disconnected terminal.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    fn as_gauge(self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
        }
    }
}

struct Link {
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

pub struct ChannelManager {
    name: String,
    broker: Arc<dyn Broker>,
    retry: RetryConfig,
    link: RwLock<Option<Link>>,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    reconnected: broadcast::Sender<u64>,
    shutdown: watch::Sender<bool>,
    metrics: Option<Arc<Metrics>>,
}

impl ChannelManager {
    /// Establish the first channel, retrying per `retry`, and start the
    /// reconnect monitor.
    pub async fn connect(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        retry: RetryConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Arc<Self>, BusError> {
        let (reconnected, _) = broadcast::channel(16);
        let manager = Arc::new(Self {
            name: name.into(),
            broker,
            retry,
            link: RwLock::new(None),
            generation: AtomicU64::new(0),
            state: watch::Sender::new(ConnectionState::Disconnected),
            reconnected,
            shutdown: watch::Sender::new(false),
            metrics,
        });

        manager.set_state(ConnectionState::Connecting);
        let channel = match manager.establish().await {
            RetryResult::Success(channel) => channel,
            RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => {
                manager.set_state(ConnectionState::Disconnected);
                return Err(BusError::MessageBusConnection(e.to_string()));
            }
        };

        let closed = channel.closed();
        manager.install(channel).await;
        manager.set_state(ConnectionState::Connected);
        tracing::info!(connection = %manager.name, "Broker connection established");

        manager.spawn_monitor(closed);
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current channel, or `MessageNotConnected` while there is none.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BusError> {
        Ok(self.current().await?.0)
    }

    /// Current channel with the generation it belongs to.
    pub(crate) async fn current(&self) -> Result<(Arc<dyn BrokerChannel>, u64), BusError> {
        self.link
            .read()
            .await
            .as_ref()
            .map(|link| (link.channel.clone(), link.generation))
            .ok_or(BusError::MessageNotConnected)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Receives the new generation after each successful reconnect.
    pub fn notify_reconnect(&self) -> broadcast::Receiver<u64> {
        self.reconnected.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn wait_shutdown(&self) {
        signalled(self.shutdown.subscribe()).await
    }

    /// Close the channel and stop reconnecting.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let link = self.link.write().await.take();
        if let Some(link) = link {
            link.channel.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(connection = %self.name, "Broker connection closed");
    }

    async fn establish(&self) -> RetryResult<Arc<dyn BrokerChannel>, super::errors::BrokerError> {
        let broker = self.broker.clone();
        retry_with_backoff(self.retry.clone(), move |_attempt| {
            let broker = broker.clone();
            async move { broker.connect().await }
        })
        .await
    }

    async fn install(&self, channel: Arc<dyn BrokerChannel>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.link.write().await = Some(Link { channel, generation });
        generation
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(connection = %self.name, from = ?previous, to = ?state, "Connection state changed");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_connection_state(&self.name, state.as_gauge());
        }
    }

    fn spawn_monitor(self: &Arc<Self>, mut closed: watch::Receiver<bool>) {
        let manager = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    changed = closed.changed() => {
                        if changed.is_ok() && !*closed.borrow() {
                            continue;
                        }
                    }
                }

                let Some(manager) = manager.upgrade() else {
                    return;
                };
                match manager.reconnect(&mut shutdown).await {
                    Some(next) => closed = next,
                    None => return,
                }
            }
        });
    }

    /// Replace a lost channel. Returns the new channel's close signal, or
    /// `None` once the manager is shut down or out of retry budget.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<watch::Receiver<bool>> {
        if self.is_shutting_down() {
            return None;
        }

        self.link.write().await.take();
        self.set_state(ConnectionState::Reconnecting);
        tracing::warn!(connection = %self.name, "Broker connection lost, reconnecting");

        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                self.set_state(ConnectionState::Disconnected);
                return None;
            }
            result = self.establish() => result,
        };

        match result {
            RetryResult::Success(channel) => {
                if self.is_shutting_down() {
                    channel.close().await;
                    return None;
                }
                let closed = channel.closed();
                let generation = self.install(channel).await;
                self.set_state(ConnectionState::Connected);
                if let Some(metrics) = &self.metrics {
                    metrics.record_reconnect(&self.name);
                }
                let _ = self.reconnected.send(generation);
                tracing::info!(connection = %self.name, generation = generation, "Broker connection re-established");
                Some(closed)
            }
            RetryResult::Failed(e) | RetryResult::PermanentFailure(e) => {
                self.set_state(ConnectionState::Disconnected);
                tracing::error!(
                    connection = %self.name,
                    error = %e,
                    "Broker reconnect budget exhausted, connection stays down"
                );
                None
            }
        }
    }
}

/// Resolves once `signal` reads `true` or its sender is gone.
pub(crate) async fn signalled(mut signal: watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}
