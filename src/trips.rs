use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::models::SavedTrip;
use crate::store::{RecordStore, SAVED_TRIPS_KEY};

pub const MAX_SAVED_TRIPS: usize = 5;

/// Recent searches, most recent first.
#[derive(Clone)]
pub struct SavedTrips {
    store: Arc<dyn RecordStore>,
}

impl SavedTrips {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Vec<SavedTrip> {
        match self.store.get(SAVED_TRIPS_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!("Saved trips are unreadable, starting over: {}", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read saved trips: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn save(&self, trip: SavedTrip) -> AppResult<Vec<SavedTrip>> {
        if trip.from.trim().is_empty() || trip.to.trim().is_empty() {
            return Err(AppError::BadRequest(
                "a saved trip needs both an origin and a destination".to_string(),
            ));
        }
        let mut trips = self.list().await;
        trips.retain(|t| t != &trip);
        trips.insert(0, trip);
        trips.truncate(MAX_SAVED_TRIPS);
        self.store
            .put(SAVED_TRIPS_KEY, serde_json::to_value(&trips)?)
            .await?;
        Ok(trips)
    }

    pub async fn clear(&self) -> AppResult<()> {
        self.store.put(SAVED_TRIPS_KEY, Value::Array(Vec::new())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn trip(from: &str, to: &str) -> SavedTrip {
        SavedTrip {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[tokio::test]
    async fn repeat_moves_to_front_once() {
        let trips = SavedTrips::new(Arc::new(MemoryStore::new()));
        trips.save(trip("A", "B")).await.unwrap();
        trips.save(trip("C", "D")).await.unwrap();
        let list = trips.save(trip("A", "B")).await.unwrap();
        assert_eq!(list, vec![trip("A", "B"), trip("C", "D")]);
        assert_eq!(trips.list().await, list);
    }

    #[tokio::test]
    async fn list_is_capped() {
        let trips = SavedTrips::new(Arc::new(MemoryStore::new()));
        for i in 0..7 {
            trips.save(trip(&format!("from{i}"), "to")).await.unwrap();
        }
        let list = trips.list().await;
        assert_eq!(list.len(), MAX_SAVED_TRIPS);
        assert_eq!(list[0], trip("from6", "to"));
        assert_eq!(list[4], trip("from2", "to"));
    }

    #[tokio::test]
    async fn reversed_pair_is_a_different_trip() {
        let trips = SavedTrips::new(Arc::new(MemoryStore::new()));
        trips.save(trip("A", "B")).await.unwrap();
        let list = trips.save(trip("B", "A")).await.unwrap();
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_value_degrades_to_empty() {
        let store = Arc::new(MemoryStore::new());
        store.put(SAVED_TRIPS_KEY, serde_json::json!("garbage")).await.unwrap();
        let trips = SavedTrips::new(store);
        assert!(trips.list().await.is_empty());
        assert_eq!(trips.save(trip("A", "B")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_trip_is_rejected() {
        let trips = SavedTrips::new(Arc::new(MemoryStore::new()));
        assert!(matches!(trips.save(trip(" ", "B")).await, Err(AppError::BadRequest(_))));
    }
}
