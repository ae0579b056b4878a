use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::errors::ProjectionError;
use super::projector::{Projection, Projector};
use super::repository::Repository;
use crate::event_sourcing::Event;

/// Receives events from the bus or from a replay.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), ProjectionError>;
}

/// A handler whose read model can be rebuilt from an aggregate's history.
#[async_trait]
pub trait Resync: EventHandler {
    /// Replace the read model for `aggregate_id` with one folded from
    /// `history`, which must be in ascending version order.
    async fn resync(&self, aggregate_id: Uuid, history: &[Event]) -> Result<(), ProjectionError>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle_event(&self, event: &Event) -> Result<(), ProjectionError> {
        (**self).handle_event(event).await
    }
}

#[async_trait]
impl<H: Resync + ?Sized> Resync for Arc<H> {
    async fn resync(&self, aggregate_id: Uuid, history: &[Event]) -> Result<(), ProjectionError> {
        (**self).resync(aggregate_id, history).await
    }
}

/// Applies each event to a projection exactly once and stores the result.
///
/// For versioned projections an event below the expected version is
/// skipped as already applied, and one above it yields
/// [`ProjectionError::Outdated`].
///
/// Read, fold and upsert for one aggregate run under a striped lock, so
/// concurrent workers never overwrite each other's result.
pub struct ProjectingEventHandler<P, R> {
    projector: P,
    repository: R,
    stripes: Vec<Mutex<()>>,
}

const LOCK_STRIPES: usize = 16;

impl<P, R> ProjectingEventHandler<P, R>
where
    P: Projector,
    R: Repository<P::Projection>,
{
    pub fn new(projector: P, repository: R) -> Self {
        Self {
            projector,
            repository,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    fn stripe(&self, id: Uuid) -> &Mutex<()> {
        &self.stripes[(id.as_u128() % LOCK_STRIPES as u128) as usize]
    }

    async fn current(&self, id: Uuid) -> Result<Option<P::Projection>, ProjectionError> {
        match self.repository.by_id(id).await {
            Ok(projection) => Ok(Some(projection)),
            Err(ProjectionError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn fold(&self, event: &Event, projection: P::Projection) -> Result<P::Projection, ProjectionError> {
        let mut next = if self.projector.is_interested(event) {
            self.projector
                .project(event, projection)
                .map_err(|source| ProjectionError::Projector {
                    event_type: event.event_type().clone(),
                    source,
                })?
        } else {
            projection
        };
        next.set_version(event.aggregate_version() + 1);
        Ok(next)
    }
}

#[async_trait]
impl<P, R> EventHandler for ProjectingEventHandler<P, R>
where
    P: Projector,
    R: Repository<P::Projection>,
{
    async fn handle_event(&self, event: &Event) -> Result<(), ProjectionError> {
        if !self.projector.follows(event) {
            return Ok(());
        }

        let id = event.aggregate_id();
        let version = event.aggregate_version();
        let _guard = self.stripe(id).lock().await;

        let projection = match self.current(id).await? {
            Some(projection) => projection,
            None if self.projector.can_create(event) => self.projector.new_projection(id),
            None if version > 0 => {
                return Err(ProjectionError::Outdated {
                    aggregate_id: id,
                    expected: 0,
                    actual: version,
                });
            }
            None => {
                tracing::debug!(aggregate_id = %id, event_type = %event.event_type(), "No projection to update");
                return Ok(());
            }
        };

        if let Some(expected) = projection.version() {
            if version < expected {
                tracing::debug!(aggregate_id = %id, version = version, expected = expected, "Event already applied");
                return Ok(());
            }
            if version > expected {
                return Err(ProjectionError::Outdated {
                    aggregate_id: id,
                    expected,
                    actual: version,
                });
            }
        }

        let next = self.fold(event, projection)?;
        self.repository.upsert(next).await
    }
}

#[async_trait]
impl<P, R> Resync for ProjectingEventHandler<P, R>
where
    P: Projector,
    R: Repository<P::Projection>,
{
    async fn resync(&self, aggregate_id: Uuid, history: &[Event]) -> Result<(), ProjectionError> {
        let _guard = self.stripe(aggregate_id).lock().await;
        let mut projection: Option<P::Projection> = None;

        for event in history {
            if event.aggregate_id() != aggregate_id || !self.projector.follows(event) {
                continue;
            }
            let current = match projection.take() {
                Some(current) => current,
                None if self.projector.can_create(event) => self.projector.new_projection(aggregate_id),
                None => continue,
            };
            projection = Some(self.fold(event, current)?);
        }

        let Some(rebuilt) = projection else {
            return Ok(());
        };
        if let Some(stored) = self.current(aggregate_id).await? {
            if let (Some(stored_version), Some(rebuilt_version)) = (stored.version(), rebuilt.version()) {
                if stored_version > rebuilt_version {
                    tracing::debug!(
                        %aggregate_id,
                        stored_version,
                        rebuilt_version,
                        "Stored projection is ahead of replayed history, keeping it"
                    );
                    return Ok(());
                }
            }
        }
        self.repository.upsert(rebuilt).await
    }
}
