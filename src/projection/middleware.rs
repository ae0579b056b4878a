use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::errors::ProjectionError;
use super::handler::{EventHandler, Resync};
use crate::event_sourcing::{AggregateType, Event, Store, StoreQuery};
use crate::metrics::Metrics;

// ============================================================================
// Replay Middleware
// ============================================================================
//
// Catches a projection up from the store when the wrapped handler reports
// it as outdated, then retries the event. Catch-up is bounded: after
// `max_catch_up_attempts` rounds the event fails with CatchUpExhausted and
// goes back to the bus for redelivery.
//
// ============================================================================

pub struct ReplayMiddleware<H> {
    inner: H,
    store: Arc<dyn Store>,
    max_catch_up_attempts: u32,
    metrics: Option<Arc<Metrics>>,
}

impl<H: EventHandler> ReplayMiddleware<H> {
    pub fn new(inner: H, store: Arc<dyn Store>, max_catch_up_attempts: u32) -> Self {
        Self {
            inner,
            store,
            max_catch_up_attempts,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// Replay every stored event before `event` through the inner handler.
    /// Already-applied versions are skipped by the handler itself.
    async fn catch_up(&self, event: &Event) -> Result<(), ProjectionError> {
        let query = StoreQuery::for_aggregate(event.aggregate_type().clone(), event.aggregate_id())
            .with_max_version(event.aggregate_version().saturating_sub(1));
        let mut history = self.store.load(&query).await?;
        history.sort_by_key(Event::aggregate_version);

        for past in &history {
            match self.inner.handle_event(past).await {
                Ok(()) => {}
                // store is missing a version too; let the retry report it
                Err(ProjectionError::Outdated { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<H: EventHandler> EventHandler for ReplayMiddleware<H> {
    async fn handle_event(&self, event: &Event) -> Result<(), ProjectionError> {
        let mut attempts = 0;

        loop {
            match self.inner.handle_event(event).await {
                Err(ProjectionError::Outdated {
                    aggregate_id,
                    expected,
                    actual,
                }) => {
                    if attempts >= self.max_catch_up_attempts {
                        tracing::error!(
                            aggregate_id = %aggregate_id,
                            attempts = attempts,
                            "Projection catch-up exhausted"
                        );
                        return Err(ProjectionError::CatchUpExhausted {
                            aggregate_id,
                            attempts,
                        });
                    }
                    attempts += 1;
                    tracing::info!(
                        aggregate_id = %aggregate_id,
                        expected = expected,
                        actual = actual,
                        attempt = attempts,
                        "Projection outdated, replaying history"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_projection_replay(event.aggregate_type().as_str());
                    }
                    self.catch_up(event).await?;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<H: Resync> Resync for ReplayMiddleware<H> {
    async fn resync(&self, aggregate_id: Uuid, history: &[Event]) -> Result<(), ProjectionError> {
        self.inner.resync(aggregate_id, history).await
    }
}

// ============================================================================
// Refresh Middleware & Warm-up
// ============================================================================

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub interval: Duration,
    /// Aggregate types to refresh. Empty means every stored event.
    pub aggregate_types: Vec<AggregateType>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            aggregate_types: Vec::new(),
        }
    }
}

/// Periodically rebuilds read models from the store, bounding how stale a
/// consumer that missed bus traffic can get. Live events pass straight
/// through to the inner handler.
pub struct RefreshMiddleware<H> {
    inner: H,
    store: Arc<dyn Store>,
    config: RefreshConfig,
    metrics: Option<Arc<Metrics>>,
}

impl<H: Resync + 'static> RefreshMiddleware<H> {
    pub fn new(inner: H, store: Arc<dyn Store>, config: RefreshConfig) -> Self {
        Self {
            inner,
            store,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    /// One resynchronization pass. Returns the number of aggregates rebuilt.
    pub async fn refresh(&self) -> Result<usize, ProjectionError> {
        let rebuilt = warm_up(self.store.as_ref(), &self.inner, &self.config.aggregate_types).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_refresh_pass();
        }
        tracing::debug!(aggregates = rebuilt, "Projection refresh pass complete");
        Ok(rebuilt)
    }

    /// Run `refresh` every interval until `shutdown` flips to true. The first
    /// pass happens one interval after start; run `warm_up` for an
    /// immediate one.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            tracing::warn!(error = %e, "Projection refresh failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("Projection refresh stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<H: Resync + 'static> EventHandler for RefreshMiddleware<H> {
    async fn handle_event(&self, event: &Event) -> Result<(), ProjectionError> {
        self.inner.handle_event(event).await
    }
}

#[async_trait]
impl<H: Resync + 'static> Resync for RefreshMiddleware<H> {
    async fn resync(&self, aggregate_id: Uuid, history: &[Event]) -> Result<(), ProjectionError> {
        self.inner.resync(aggregate_id, history).await
    }
}

/// Drive `handler` over the full stored history of `aggregate_types` (all
/// types when empty), one aggregate at a time. Run at startup before the
/// handler is subscribed to the bus. Returns the number of aggregates rebuilt.
pub async fn warm_up<H>(
    store: &dyn Store,
    handler: &H,
    aggregate_types: &[AggregateType],
) -> Result<usize, ProjectionError>
where
    H: Resync + ?Sized,
{
    let mut events = Vec::new();
    if aggregate_types.is_empty() {
        events = store.load(&StoreQuery::new()).await?;
    } else {
        for aggregate_type in aggregate_types {
            let query = StoreQuery::new().with_aggregate_type(aggregate_type.clone());
            events.extend(store.load(&query).await?);
        }
    }

    let mut streams: BTreeMap<(AggregateType, Uuid), Vec<Event>> = BTreeMap::new();
    for event in events {
        streams
            .entry((event.aggregate_type().clone(), event.aggregate_id()))
            .or_default()
            .push(event);
    }

    let rebuilt = streams.len();
    for ((_, aggregate_id), mut history) in streams {
        history.sort_by_key(Event::aggregate_version);
        handler.resync(aggregate_id, &history).await?;
    }

    tracing::info!(aggregates = rebuilt, "Projections warmed up");
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::MemoryStore;
    use crate::projection::handler::test_support::{noted, Notes, NotesProjector};
    use crate::projection::{MemoryRepository, ProjectingEventHandler, Repository};

    type Notebook = ProjectingEventHandler<NotesProjector, MemoryRepository<Notes>>;

    async fn store_with(events: &[Event]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.connect().await.unwrap();
        if !events.is_empty() {
            store.save(events).await.unwrap();
        }
        store
    }

    fn notebook() -> (Notebook, MemoryRepository<Notes>) {
        let repository = MemoryRepository::new();
        (ProjectingEventHandler::new(NotesProjector, repository.clone()), repository)
    }

    #[tokio::test]
    async fn test_replay_fills_gap_before_retrying() {
        let id = Uuid::new_v4();
        let history = vec![noted(id, 0, "a"), noted(id, 1, "b"), noted(id, 2, "c")];
        let store = store_with(&history).await;
        let (inner, repository) = notebook();
        let metrics = Arc::new(Metrics::new().unwrap());
        let replay = ReplayMiddleware::new(inner, store, 3).with_metrics(metrics.clone());

        replay.handle_event(&history[0]).await.unwrap();
        // version 1 was lost on the bus
        replay.handle_event(&history[2]).await.unwrap();

        let notes = repository.by_id(id).await.unwrap();
        assert_eq!(notes.words, vec!["a", "b", "c"]);
        assert_eq!(notes.version, 3);
        assert_eq!(metrics.projection_replays.with_label_values(&["Notebook"]).get(), 1);
    }

    #[tokio::test]
    async fn test_catch_up_is_bounded() {
        let id = Uuid::new_v4();
        // the store never saw version 1 or 2
        let store = store_with(&[noted(id, 0, "a")]).await;
        let (inner, _repository) = notebook();
        let replay = ReplayMiddleware::new(inner, store, 2);

        replay.handle_event(&noted(id, 0, "a")).await.unwrap();
        let result = replay.handle_event(&noted(id, 3, "d")).await;

        assert!(matches!(
            result,
            Err(ProjectionError::CatchUpExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_warm_up_rebuilds_every_aggregate() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        store.connect().await.unwrap();
        store.save(&[noted(first, 0, "x"), noted(first, 1, "y")]).await.unwrap();
        store.save(&[noted(second, 0, "z")]).await.unwrap();
        let (handler, repository) = notebook();

        let rebuilt = warm_up(store.as_ref(), &handler, &[AggregateType::new("Notebook").unwrap()])
            .await
            .unwrap();

        assert_eq!(rebuilt, 2);
        assert_eq!(repository.by_id(first).await.unwrap().words, vec!["x", "y"]);
        assert_eq!(repository.by_id(second).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_refresh_repairs_missed_events() {
        let id = Uuid::new_v4();
        let store = store_with(&[noted(id, 0, "a"), noted(id, 1, "b")]).await;
        let (inner, repository) = notebook();
        let refresh = RefreshMiddleware::new(inner, store.clone(), RefreshConfig::default());

        refresh.handle_event(&noted(id, 0, "a")).await.unwrap();
        assert_eq!(repository.by_id(id).await.unwrap().version, 1);

        refresh.refresh().await.unwrap();
        assert_eq!(repository.by_id(id).await.unwrap().words, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_runs_on_interval_until_shutdown() {
        let id = Uuid::new_v4();
        let store = store_with(&[noted(id, 0, "a")]).await;
        let (inner, repository) = notebook();
        let metrics = Arc::new(Metrics::new().unwrap());
        let refresh = Arc::new(
            RefreshMiddleware::new(
                inner,
                store,
                RefreshConfig {
                    interval: Duration::from_secs(30),
                    aggregate_types: Vec::new(),
                },
            )
            .with_metrics(metrics.clone()),
        );
        let (stop, shutdown) = watch::channel(false);

        let task = refresh.clone().start(shutdown);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(repository.by_id(id).await.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(repository.by_id(id).await.unwrap().words, vec!["a"]);
        assert_eq!(metrics.refresh_passes.get(), 1);

        stop.send(true).unwrap();
        task.await.unwrap();
    }
}
