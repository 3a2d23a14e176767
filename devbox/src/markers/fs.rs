//! Marker store backed by a directory of files.

use super::{validate_marker_id, Marker, MarkerStore};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One file per marker, named by id, containing an RFC 3339 timestamp.
#[derive(Debug, Clone)]
pub struct FsMarkerStore {
    dir: PathBuf,
}

impl FsMarkerStore {
    /// Creates a store over `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the marker directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self, id: &str) -> Result<PathBuf> {
        validate_marker_id(id)?;
        Ok(self.dir.join(id))
    }

    async fn read_marker(path: &Path) -> Result<Option<DateTime<Utc>>> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Ok(ts) = DateTime::parse_from_rfc3339(text.trim()) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }

        // Hand-made markers (e.g. `touch`) still count; fall back to mtime.
        let modified = tokio::fs::metadata(path).await?.modified()?;
        Ok(Some(DateTime::<Utc>::from(modified)))
    }
}

#[async_trait]
impl MarkerStore for FsMarkerStore {
    async fn is_complete(&self, id: &str) -> Result<bool> {
        let path = self.marker_path(id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn mark_complete(&self, id: &str) -> Result<Marker> {
        let path = self.marker_path(id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let completed_at = Utc::now();
        // Write then rename so a crash never leaves a half-written marker.
        let tmp = self.dir.join(format!(".{id}.tmp"));
        tokio::fs::write(&tmp, format!("{}\n", completed_at.to_rfc3339())).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(marker = %id, path = %path.display(), "marker written");

        Ok(Marker {
            id: id.to_string(),
            completed_at,
        })
    }

    async fn completed_at(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.marker_path(id)?;
        Self::read_marker(&path).await
    }

    async fn list(&self) -> Result<Vec<Marker>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut markers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(id) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if validate_marker_id(&id).is_err() || !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(completed_at) = Self::read_marker(&entry.path()).await? {
                markers.push(Marker { id, completed_at });
            }
        }

        markers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(markers)
    }

    async fn clear(&self, id: &str) -> Result<bool> {
        let path = self.marker_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
