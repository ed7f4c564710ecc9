//! Folds activity events into [`AccommodationStore`].

use crate::model::AccommodationProjection;
use crate::store::{AccommodationStore, StoreError};
use stayflow_core::activity::ActivityEvent;
use stayflow_core::event_store::EventStore;
use stayflow_core::projection::{ApplyOutcome, Projection, ProjectionError, Result};
use stayflow_core::stream::{Sequence, StreamId};

/// Events read per page when rebuilding from the event store.
pub const REBUILD_PAGE_SIZE: usize = 100;

/// The accommodation metrics projection.
///
/// The first event of an accommodation creates its projection; later events update it.
#[derive(Clone)]
pub struct AccommodationProjector {
    store: AccommodationStore,
}

impl AccommodationProjector {
    /// Project into `store`.
    #[must_use]
    pub const fn new(store: AccommodationStore) -> Self {
        Self { store }
    }

    /// The store this projector writes to.
    #[must_use]
    pub const fn store(&self) -> &AccommodationStore {
        &self.store
    }

    /// Recompute one accommodation from its stream and replace the stored projection.
    ///
    /// Reads the stream from the first sequence in pages of [`REBUILD_PAGE_SIZE`]. Events
    /// with an unknown type tag are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Rebuild`] if the stream cannot be read or an event
    /// cannot be decoded.
    #[tracing::instrument(skip(self, event_store))]
    pub async fn rebuild_accommodation(
        &self,
        event_store: &dyn EventStore,
        accommodation_id: &str,
    ) -> Result<AccommodationProjection> {
        let mut projection = AccommodationProjection::new(accommodation_id);
        replay_stream(event_store, accommodation_id, |sequence, event| {
            projection.apply(sequence, event);
        })
        .await?;

        self.save(projection.clone()).await?;

        tracing::info!(
            accommodation_id,
            visits = projection.number_of_visits,
            "Projection rebuilt from event store"
        );
        Ok(projection)
    }

    async fn save(&self, projection: AccommodationProjection) -> Result<()> {
        match self.store.update(projection.clone()).await {
            Err(StoreError::NotFound(_)) => self
                .store
                .create(projection)
                .await
                .map_err(|e| ProjectionError::Storage(e.to_string())),
            other => other.map_err(|e| ProjectionError::Storage(e.to_string())),
        }
    }
}

/// Feed every known event of one accommodation's stream to `apply`, oldest first.
///
/// Reads in pages of [`REBUILD_PAGE_SIZE`]. Events with an unknown type tag are skipped.
pub(crate) async fn replay_stream<F>(
    event_store: &dyn EventStore,
    accommodation_id: &str,
    mut apply: F,
) -> Result<()>
where
    F: FnMut(Sequence, &ActivityEvent),
{
    let registry = ActivityEvent::registry();
    let stream_id = StreamId::for_accommodation(accommodation_id);
    let mut from = Sequence::FIRST;

    loop {
        let page = event_store
            .read_stream(stream_id.clone(), from, REBUILD_PAGE_SIZE)
            .await
            .map_err(|e| ProjectionError::Rebuild(e.to_string()))?;

        for recorded in &page {
            if !registry.knows(recorded.event_type()) {
                tracing::warn!(
                    stream_id = %stream_id,
                    sequence = %recorded.sequence,
                    event_type = recorded.event_type(),
                    "Skipping unknown event type during rebuild"
                );
                continue;
            }
            let event = registry
                .decode(recorded.event_type(), &recorded.event.data)
                .map_err(|e| ProjectionError::Rebuild(e.to_string()))?;
            apply(recorded.sequence, &event);
        }

        match page.last() {
            Some(last) if page.len() == REBUILD_PAGE_SIZE => from = last.sequence.next(),
            _ => return Ok(()),
        }
    }
}

impl Projection for AccommodationProjector {
    type Event = ActivityEvent;

    fn name(&self) -> &'static str {
        "accommodation_metrics"
    }

    async fn apply_event(&self, sequence: Sequence, event: &Self::Event) -> Result<ApplyOutcome> {
        let id = event.accommodation_id();
        let (mut projection, exists) = match self.store.read(id).await {
            Ok(projection) => (projection, true),
            Err(StoreError::NotFound(_)) => (AccommodationProjection::new(id), false),
            Err(e) => return Err(ProjectionError::Storage(e.to_string())),
        };

        let outcome = projection.apply(sequence, event);
        if outcome == ApplyOutcome::Duplicate {
            tracing::debug!(
                accommodation_id = id,
                sequence = %sequence,
                kind = ?event.kind(),
                "Event already applied"
            );
            return Ok(outcome);
        }

        let saved = if exists {
            self.store.update(projection).await
        } else {
            self.store.create(projection).await
        };
        saved.map_err(|e| ProjectionError::Storage(e.to_string()))?;

        Ok(outcome)
    }

    async fn rebuild(&self) -> Result<()> {
        self.store.clear().await;
        Ok(())
    }
}
