use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::errors::ProjectionError;
use super::projector::Projection;

/// Storage for one projection type.
#[async_trait]
pub trait Repository<P: Projection>: Send + Sync {
    async fn by_id(&self, id: Uuid) -> Result<P, ProjectionError>;

    async fn all(&self) -> Result<Vec<P>, ProjectionError>;

    async fn upsert(&self, projection: P) -> Result<(), ProjectionError>;

    /// Removing an id that is not present succeeds.
    async fn remove(&self, id: Uuid) -> Result<(), ProjectionError>;
}

/// In-process repository. Clones share the same table.
pub struct MemoryRepository<P> {
    projections: Arc<RwLock<HashMap<Uuid, P>>>,
}

impl<P> Clone for MemoryRepository<P> {
    fn clone(&self) -> Self {
        Self {
            projections: self.projections.clone(),
        }
    }
}

impl<P> Default for MemoryRepository<P> {
    fn default() -> Self {
        Self {
            projections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<P> MemoryRepository<P> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<P: Projection> Repository<P> for MemoryRepository<P> {
    async fn by_id(&self, id: Uuid) -> Result<P, ProjectionError> {
        self.projections
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ProjectionError::NotFound(id))
    }

    async fn all(&self) -> Result<Vec<P>, ProjectionError> {
        Ok(self.projections.read().await.values().cloned().collect())
    }

    async fn upsert(&self, projection: P) -> Result<(), ProjectionError> {
        self.projections.write().await.insert(projection.id(), projection);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), ProjectionError> {
        self.projections.write().await.remove(&id);
        Ok(())
    }
}
