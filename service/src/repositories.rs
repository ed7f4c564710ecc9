//! In-process repositories behind the saga participants.
//!
//! The saga only sees the repository traits; these implementations keep their data in
//! memory for the lifetime of the process.

use stayflow_saga::error::{Result, SagaError};
use stayflow_saga::{AccommodationRepository, AvailabilityRepository, FreeReservation};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Free dates per accommodation.
#[derive(Default)]
pub struct InMemoryAvailability {
    free: RwLock<HashMap<String, Vec<FreeReservation>>>,
}

impl InMemoryAvailability {
    /// Empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Free dates stored for `accommodation_id`.
    pub async fn for_accommodation(&self, accommodation_id: &str) -> Vec<FreeReservation> {
        self.free
            .read()
            .await
            .get(accommodation_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check(reservation: &FreeReservation) -> Result<()> {
        if reservation.location.trim().is_empty() {
            return Err(SagaError::Repository(format!(
                "accommodation {} has no location",
                reservation.accommodation_id
            )));
        }
        if let Some(range) = reservation
            .date_ranges
            .iter()
            .find(|range| range.date_range.is_empty() || range.price < 0)
        {
            return Err(SagaError::Repository(format!(
                "invalid date range {:?} priced {}",
                range.date_range, range.price
            )));
        }
        Ok(())
    }
}

impl AvailabilityRepository for InMemoryAvailability {
    fn create_availability(
        &self,
        reservation: FreeReservation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            Self::check(&reservation)?;
            self.free
                .write()
                .await
                .entry(reservation.accommodation_id.clone())
                .or_default()
                .push(reservation);
            Ok(())
        })
    }
}

/// Approval status of an accommodation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccommodationStatus {
    /// Free dates were stored; the accommodation is listed
    Approved,
    /// The saga rolled back; the accommodation stays hidden
    Denied,
}

/// Accommodation statuses by id.
#[derive(Default)]
pub struct InMemoryAccommodations {
    statuses: RwLock<HashMap<String, AccommodationStatus>>,
}

impl InMemoryAccommodations {
    /// Empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status of `accommodation_id`, if the saga has decided.
    pub async fn status(&self, accommodation_id: &str) -> Option<AccommodationStatus> {
        self.statuses.read().await.get(accommodation_id).copied()
    }

    async fn set(&self, accommodation_id: String, status: AccommodationStatus) -> Result<()> {
        if accommodation_id.is_empty() {
            return Err(SagaError::Repository("empty accommodation id".to_string()));
        }
        self.statuses.write().await.insert(accommodation_id, status);
        Ok(())
    }
}

impl AccommodationRepository for InMemoryAccommodations {
    fn approve(
        &self,
        accommodation_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.set(accommodation_id, AccommodationStatus::Approved))
    }

    fn deny(&self, accommodation_id: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.set(accommodation_id, AccommodationStatus::Denied))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use stayflow_saga::DateRangeWithPrice;

    fn reservation(location: &str, price: i64) -> FreeReservation {
        FreeReservation {
            accommodation_id: "A1".to_string(),
            location: location.to_string(),
            date_ranges: vec![DateRangeWithPrice {
                date_range: vec!["2024-07-01".to_string()],
                price,
            }],
        }
    }

    #[tokio::test]
    async fn valid_availability_is_stored() {
        let repository = InMemoryAvailability::new();

        repository
            .create_availability(reservation("Novi Sad", 100))
            .await
            .unwrap();

        assert_eq!(repository.for_accommodation("A1").await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_availability_is_refused() {
        let repository = InMemoryAvailability::new();

        assert!(repository.create_availability(reservation("", 100)).await.is_err());
        assert!(repository.create_availability(reservation("Novi Sad", -1)).await.is_err());
        assert!(repository.for_accommodation("A1").await.is_empty());
    }

    #[tokio::test]
    async fn latest_verdict_wins() {
        let repository = InMemoryAccommodations::new();

        repository.approve("A1".to_string()).await.unwrap();
        repository.deny("A1".to_string()).await.unwrap();

        assert_eq!(repository.status("A1").await, Some(AccommodationStatus::Denied));
        assert_eq!(repository.status("B2").await, None);
    }
}
