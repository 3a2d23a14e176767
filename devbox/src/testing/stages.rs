//! Stages for pipeline tests.

use crate::environment::EnvFragment;
use crate::pipeline::{StageContext, StageOutput};
use crate::stages::Stage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A stage that succeeds, optionally contributes a fragment, and records
/// what it saw.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    env: Option<EnvFragment>,
    calls: AtomicUsize,
    seen_sources: Mutex<Vec<Vec<String>>>,
}

impl RecordingStage {
    /// Creates a stage contributing nothing.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env: None,
            calls: AtomicUsize::new(0),
            seen_sources: Mutex::new(Vec::new()),
        }
    }

    /// Contributes `key=value` on success.
    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env = Some(
            self.env
                .take()
                .unwrap_or_else(|| EnvFragment::new(&self.name))
                .with(key, value),
        );
        self
    }

    /// Number of executions.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Descriptor sources visible at each execution.
    #[must_use]
    pub fn seen_sources(&self) -> Vec<Vec<String>> {
        self.seen_sources.lock().clone()
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_sources.lock().push(
            ctx.descriptor()
                .sources()
                .into_iter()
                .map(String::from)
                .collect(),
        );
        match &self.env {
            Some(fragment) => StageOutput::ok_with_env(fragment.clone()),
            None => StageOutput::ok(),
        }
    }
}

/// A stage that fails until it has been called a number of times.
///
/// Clones share the call counter, so the same stage can be handed to
/// several pipelines that stand for successive runs.
#[derive(Debug, Clone)]
pub struct FlakyStage {
    name: String,
    failures: usize,
    env: Option<EnvFragment>,
    calls: Arc<AtomicUsize>,
}

impl FlakyStage {
    /// Fails the first `failures` executions.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: usize) -> Self {
        Self {
            name: name.into(),
            failures,
            env: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Contributes `key=value` once it succeeds.
    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env = Some(EnvFragment::new(&self.name).with(key, value));
        self
    }

    /// Number of executions.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FlakyStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return StageOutput::fail(format!("scripted failure {} of {}", call + 1, self.failures));
        }
        match &self.env {
            Some(fragment) => StageOutput::ok_with_env(fragment.clone()),
            None => StageOutput::ok(),
        }
    }
}
