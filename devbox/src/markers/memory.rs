//! In-memory marker store.

use super::{validate_marker_id, Marker, MarkerStore};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Marker store that lives in memory; used in tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryMarkerStore {
    entries: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl InMemoryMarkerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ids of all markers.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl MarkerStore for InMemoryMarkerStore {
    async fn is_complete(&self, id: &str) -> Result<bool> {
        validate_marker_id(id)?;
        Ok(self.entries.lock().contains_key(id))
    }

    async fn mark_complete(&self, id: &str) -> Result<Marker> {
        validate_marker_id(id)?;
        let completed_at = Utc::now();
        self.entries.lock().insert(id.to_string(), completed_at);
        Ok(Marker {
            id: id.to_string(),
            completed_at,
        })
    }

    async fn completed_at(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        validate_marker_id(id)?;
        Ok(self.entries.lock().get(id).copied())
    }

    async fn list(&self) -> Result<Vec<Marker>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(id, completed_at)| Marker {
                id: id.clone(),
                completed_at: *completed_at,
            })
            .collect())
    }

    async fn clear(&self, id: &str) -> Result<bool> {
        validate_marker_id(id)?;
        Ok(self.entries.lock().remove(id).is_some())
    }
}
