//! Completion markers for install stages.
//!
//! A marker exists iff its stage completed. Its value is the completion
//! timestamp. Markers are never removed automatically; clearing one by hand
//! forces the stage to run again.

mod fs;
mod memory;

pub use fs::FsMarkerStore;
pub use memory::InMemoryMarkerStore;

use crate::errors::{DevboxError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A completed stage record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    /// The marker id.
    pub id: String,
    /// When the stage completed.
    pub completed_at: DateTime<Utc>,
}

/// Storage backend for markers.
#[async_trait]
pub trait MarkerStore: Send + Sync + std::fmt::Debug {
    /// Returns true if the marker exists.
    async fn is_complete(&self, id: &str) -> Result<bool>;

    /// Records completion now.
    async fn mark_complete(&self, id: &str) -> Result<Marker>;

    /// Returns the completion time, if the marker exists.
    async fn completed_at(&self, id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Lists all markers sorted by id.
    async fn list(&self) -> Result<Vec<Marker>>;

    /// Removes a marker. Returns true if one existed.
    async fn clear(&self, id: &str) -> Result<bool>;
}

/// Checks that a marker id is usable as a file name.
pub fn validate_marker_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DevboxError::InvalidMarkerId(id.to_string()))
    }
}
