//! Consecutive readiness timeouts across restarts.

use crate::errors::Result;
use crate::layout::PersistedPath;
use std::io::ErrorKind;

/// Counter of consecutive starts on which the daemon never became ready.
#[derive(Debug, Clone)]
pub struct ReadinessLedger {
    path: PersistedPath,
}

impl ReadinessLedger {
    /// Creates a ledger stored at `path`.
    #[must_use]
    pub fn new(path: PersistedPath) -> Self {
        Self { path }
    }

    /// Current count. Missing or unreadable counts as zero.
    #[must_use]
    pub fn count(&self) -> u32 {
        std::fs::read_to_string(self.path.path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Records one more timeout and returns the new count.
    pub fn record_timeout(&self) -> Result<u32> {
        let next = self.count().saturating_add(1);
        if let Some(parent) = self.path.path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(self.path.path(), format!("{next}\n"))?;
        Ok(next)
    }

    /// Forgets earlier timeouts.
    pub fn reset(&self) -> Result<()> {
        match self.path.remove() {
            Ok(_) => Ok(()),
            Err(crate::errors::DevboxError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
