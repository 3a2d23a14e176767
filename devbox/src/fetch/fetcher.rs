//! Strategy chain driver.

use super::strategy::{FallbackStrategy, FetchStrategy, ResumingStrategy, SegmentedStrategy};
use crate::config::FetchConfig;
use crate::errors::FetchError;
use crate::process::CommandRunner;
use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    /// Source URI.
    pub uri: String,
    /// Where the file must end up.
    pub destination: PathBuf,
    /// Expected SHA-256 digest (hex), if known.
    pub sha256: Option<String>,
}

impl FetchTask {
    /// Creates a task without a checksum.
    #[must_use]
    pub fn new(uri: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            uri: uri.into(),
            destination: destination.into(),
            sha256: None,
        }
    }

    /// Sets the expected digest.
    #[must_use]
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }
}

/// Downloads with the first available strategy of an ordered chain.
#[derive(Debug, Clone)]
pub struct ResilientFetcher {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    fall_through: bool,
}

impl ResilientFetcher {
    /// Creates a fetcher with an explicit chain.
    #[must_use]
    pub fn new(strategies: Vec<Arc<dyn FetchStrategy>>) -> Self {
        Self {
            strategies,
            fall_through: false,
        }
    }

    /// Builds the standard chain: segmented, then resuming, then fallback.
    #[must_use]
    pub fn from_config(config: &FetchConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let strategies: Vec<Arc<dyn FetchStrategy>> = vec![
            Arc::new(SegmentedStrategy::new(runner.clone(), config)),
            Arc::new(ResumingStrategy::new(runner.clone(), config)),
            Arc::new(FallbackStrategy::new(runner, config)),
        ];
        Self::new(strategies).with_fall_through(config.fall_through)
    }

    /// When set, a failing strategy hands over to the next available one.
    #[must_use]
    pub fn with_fall_through(mut self, fall_through: bool) -> Self {
        self.fall_through = fall_through;
        self
    }

    /// Returns the strategy names in chain order.
    #[must_use]
    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Downloads `task.uri` to `task.destination`.
    ///
    /// Succeeds only if the destination exists, is non-empty, and matches
    /// the expected digest when one is given.
    pub async fn fetch(&self, task: &FetchTask) -> Result<PathBuf, FetchError> {
        let available: Vec<&Arc<dyn FetchStrategy>> =
            self.strategies.iter().filter(|s| s.is_available()).collect();

        if available.is_empty() {
            return Err(FetchError::NoStrategyAvailable {
                uri: task.uri.clone(),
                tried: self.strategy_names().into_iter().map(String::from).collect(),
            });
        }

        if let Some(parent) = task.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::Destination {
                    path: parent.to_path_buf(),
                    reason: e.to_string(),
                })?;
        }

        let attempts = if self.fall_through { available.len() } else { 1 };
        let mut last_error = None;

        for strategy in available.into_iter().take(attempts) {
            info!(
                uri = %task.uri,
                strategy = strategy.name(),
                destination = %task.destination.display(),
                "fetching"
            );

            let outcome = match strategy.fetch(task).await {
                Ok(()) => verify(task, strategy.name()).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    info!(uri = %task.uri, strategy = strategy.name(), "fetch complete");
                    return Ok(task.destination.clone());
                }
                Err(e) => {
                    warn!(uri = %task.uri, strategy = strategy.name(), error = %e, "fetch failed");
                    remove_partial(&task.destination).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::NoStrategyAvailable {
            uri: task.uri.clone(),
            tried: Vec::new(),
        }))
    }
}

async fn verify(task: &FetchTask, strategy: &str) -> Result<(), FetchError> {
    let missing = || FetchError::MissingOutput {
        uri: task.uri.clone(),
        strategy: strategy.to_string(),
        destination: task.destination.clone(),
    };

    match tokio::fs::metadata(&task.destination).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {}
        Ok(_) => return Err(missing()),
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(missing()),
        Err(e) => {
            return Err(FetchError::Destination {
                path: task.destination.clone(),
                reason: e.to_string(),
            })
        }
    }

    if let Some(expected) = &task.sha256 {
        let path = task.destination.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| FetchError::Destination {
                path: task.destination.clone(),
                reason: e.to_string(),
            })?
            .map_err(|e| FetchError::Destination {
                path: task.destination.clone(),
                reason: e.to_string(),
            })?;

        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(FetchError::ChecksumMismatch {
                uri: task.uri.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        debug!(uri = %task.uri, "checksum verified");
    }

    Ok(())
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial download"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial download"),
    }
}

/// Computes the hex SHA-256 digest of a file.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
