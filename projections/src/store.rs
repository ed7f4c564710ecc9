//! In-process stores for projections.
//!
//! Readers (query handlers) run concurrently; writes are serialized behind the lock.
//! The event stream consumer is the only writer in a running service, so a
//! read-modify-write sequence from the projector never races another writer.

use crate::model::AccommodationProjection;
use crate::period::PeriodReport;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors raised by [`ProjectionStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `create` was called for an id that is already stored
    #[error("Projection already exists: {0}")]
    AlreadyExists(String),

    /// No projection is stored under the id
    #[error("Projection not found: {0}")]
    NotFound(String),
}

/// A read model stored under its accommodation id.
pub trait Keyed: Clone + Send + Sync + 'static {
    /// Accommodation id the value is stored under.
    fn key(&self) -> &str;
}

impl Keyed for AccommodationProjection {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for PeriodReport {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Projections keyed by accommodation id.
///
/// Clones share the same map.
#[derive(Clone)]
pub struct ProjectionStore<P> {
    projections: Arc<RwLock<HashMap<String, P>>>,
}

/// Lifetime metrics per accommodation.
pub type AccommodationStore = ProjectionStore<AccommodationProjection>;

/// Daily and monthly reports per accommodation.
pub type PeriodStore = ProjectionStore<PeriodReport>;

impl<P: Keyed> Default for ProjectionStore<P> {
    fn default() -> Self {
        Self {
            projections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<P: Keyed> ProjectionStore<P> {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a projection for a new id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken.
    pub async fn create(&self, projection: P) -> Result<(), StoreError> {
        let mut projections = self.projections.write().await;
        if projections.contains_key(projection.key()) {
            return Err(StoreError::AlreadyExists(projection.key().to_string()));
        }
        projections.insert(projection.key().to_string(), projection);
        Ok(())
    }

    /// Copy of the projection stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if nothing is stored under `id`.
    pub async fn read(&self, id: &str) -> Result<P, StoreError> {
        self.projections
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Replace the stored projection with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id was never created.
    pub async fn update(&self, projection: P) -> Result<(), StoreError> {
        let mut projections = self.projections.write().await;
        match projections.get_mut(projection.key()) {
            Some(stored) => {
                *stored = projection;
                Ok(())
            },
            None => Err(StoreError::NotFound(projection.key().to_string())),
        }
    }

    /// Insert or replace.
    pub async fn upsert(&self, projection: P) {
        self.projections
            .write()
            .await
            .insert(projection.key().to_string(), projection);
    }

    /// Every projection, sorted by id.
    pub async fn read_all(&self) -> Vec<P> {
        let mut all: Vec<_> = self.projections.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(b.key()));
        all
    }

    /// Drop every projection.
    pub async fn clear(&self) {
        self.projections.write().await.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn create_then_read() {
        let store = AccommodationStore::new();
        store.create(AccommodationProjection::new("A1")).await.unwrap();

        assert_eq!(store.read("A1").await.unwrap().id, "A1");
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let store = AccommodationStore::new();
        assert_ok!(store.create(AccommodationProjection::new("A1")).await);

        let err = assert_err!(store.create(AccommodationProjection::new("A1")).await);
        assert_eq!(err, StoreError::AlreadyExists("A1".to_string()));
    }

    #[tokio::test]
    async fn missing_ids_are_not_found() {
        let store = AccommodationStore::new();

        assert_eq!(
            store.read("nope").await.unwrap_err(),
            StoreError::NotFound("nope".to_string())
        );
        assert_eq!(
            store.update(AccommodationProjection::new("nope")).await.unwrap_err(),
            StoreError::NotFound("nope".to_string())
        );
    }

    #[tokio::test]
    async fn update_replaces_whole_projection() {
        let store = AccommodationStore::new();
        store.create(AccommodationProjection::new("A1")).await.unwrap();

        let mut changed = AccommodationProjection::new("A1");
        changed.number_of_ratings = 4;
        store.update(changed.clone()).await.unwrap();

        assert_eq!(store.read("A1").await.unwrap(), changed);
    }

    #[tokio::test]
    async fn read_all_is_sorted() {
        let store = AccommodationStore::new();
        for id in ["B", "C", "A"] {
            store.create(AccommodationProjection::new(id)).await.unwrap();
        }

        let ids: Vec<String> = store.read_all().await.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn concurrent_readers() {
        let store = AccommodationStore::new();
        store.create(AccommodationProjection::new("A1")).await.unwrap();

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.read("A1").await })
            })
            .collect();

        for reader in readers {
            assert_ok!(reader.await.unwrap());
        }
    }
}
