//! Event sinks.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

/// Receives named events from the pipeline and the reconcilers.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers an event.
    async fn emit(&self, event: &str, data: Option<Value>);

    /// Delivers an event from synchronous code. Must not fail or block.
    fn try_emit(&self, event: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event: &str, _data: Option<Value>) {}
}

/// Writes events to the `tracing` subscriber.
///
/// Failures, issues and watcher timeouts are logged at WARN whatever the
/// configured level. The `stage` or `service` of the payload is lifted into
/// its own field so log filters can match on it.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Logs routine events at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Logs routine events at DEBUG.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log(&self, event: &str, data: Option<&Value>) {
        let subject = subject(data);
        if is_warning(event) {
            warn!(event, subject, data = ?data, "devbox event");
        } else if self.level >= Level::DEBUG {
            debug!(event, subject, data = ?data, "devbox event");
        } else {
            info!(event, subject, data = ?data, "devbox event");
        }
    }
}

fn is_warning(event: &str) -> bool {
    event.ends_with(".failed") || event == super::names::SERVICE_ISSUE || event == super::names::WATCHER_TIMEOUT
}

fn subject(data: Option<&Value>) -> &str {
    data.and_then(|d| d.get("stage").or_else(|| d.get("service")))
        .and_then(Value::as_str)
        .unwrap_or("-")
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &str, data: Option<Value>) {
        self.log(event, data.as_ref());
    }

    fn try_emit(&self, event: &str, data: Option<Value>) {
        self.log(event, data.as_ref());
    }
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.lock().clone()
    }

    /// Event names in arrival order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Number of events received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Forgets everything received so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Events whose name starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn push(&self, event: &str, data: Option<Value>) {
        self.events.lock().push((event.to_string(), data));
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &str, data: Option<Value>) {
        self.push(event, data);
    }

    fn try_emit(&self, event: &str, data: Option<Value>) {
        self.push(event, data);
    }
}
