//! Event emission for install and bring-up observability.
//!
//! Components emit named events with a JSON payload to an [`EventSink`].
//! The names are stable and listed in [`names`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// Event names emitted by devbox components.
pub mod names {
    /// Pipeline run begins.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// Every stage completed or was skipped.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// The pipeline aborted on a stage failure.
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    /// A stage action is about to run.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage was skipped because its marker exists.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage action succeeded and its marker was written.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage action failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A service observation changed.
    pub const SERVICE_TRANSITION: &str = "service.transition";
    /// A fail-soft issue was recorded during bring-up.
    pub const SERVICE_ISSUE: &str = "service.issue";
    /// The background watcher saw the service running.
    pub const WATCHER_CONNECTED: &str = "watcher.connected";
    /// The background watcher gave up.
    pub const WATCHER_TIMEOUT: &str = "watcher.timeout";
}

/// Returns the default sink, which logs events through `tracing`.
#[must_use]
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(LoggingEventSink::default())
}
