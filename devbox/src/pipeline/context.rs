//! Execution context handed to stages.

use crate::cancellation::CancellationToken;
use crate::config::DevboxConfig;
use crate::environment::{DescriptorFile, EnvironmentDescriptor, ResolvedEnv};
use crate::events::{self, EventSink, NoOpEventSink};
use crate::fetch::ResilientFetcher;
use crate::layout::PersistentLayout;
use crate::markers::{FsMarkerStore, MarkerStore};
use crate::process::CommandRunner;
use std::sync::Arc;
use uuid::Uuid;

/// Shared services a pipeline runs against.
#[derive(Clone)]
pub struct PipelineRuntime {
    /// Volume layout.
    pub layout: PersistentLayout,
    /// Completion markers.
    pub markers: Arc<dyn MarkerStore>,
    /// Environment descriptor persistence.
    pub descriptor: DescriptorFile,
    /// Downloads.
    pub fetcher: Arc<ResilientFetcher>,
    /// External programs.
    pub runner: Arc<dyn CommandRunner>,
    /// Event sink.
    pub event_sink: Arc<dyn EventSink>,
    /// Cancellation checked between stages.
    pub cancel_token: Arc<CancellationToken>,
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("layout", &self.layout)
            .field("markers", &self.markers)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl PipelineRuntime {
    /// Creates a runtime over `layout` with filesystem markers.
    #[must_use]
    pub fn new(
        layout: PersistentLayout,
        fetcher: ResilientFetcher,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            markers: Arc::new(FsMarkerStore::new(layout.markers_dir().path())),
            descriptor: DescriptorFile::new(layout.descriptor_file().path()),
            layout,
            fetcher: Arc::new(fetcher),
            runner,
            event_sink: Arc::new(NoOpEventSink),
            cancel_token: Arc::new(CancellationToken::new()),
        }
    }

    /// Creates the runtime described by a configuration.
    #[must_use]
    pub fn from_config(config: &DevboxConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let layout = PersistentLayout::new(&config.volume_root);
        let fetcher = ResilientFetcher::from_config(&config.fetch, runner.clone());
        Self::new(layout, fetcher, runner).with_event_sink(events::default_sink())
    }

    /// Replaces the marker store.
    #[must_use]
    pub fn with_markers(mut self, markers: Arc<dyn MarkerStore>) -> Self {
        self.markers = markers;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Replaces the cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel_token = token;
        self
    }
}

/// What a stage sees while it runs.
#[derive(Debug, Clone)]
pub struct StageContext {
    run_id: Uuid,
    stage: String,
    descriptor: EnvironmentDescriptor,
    runtime: PipelineRuntime,
}

impl StageContext {
    /// Creates a context for one stage execution.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        stage: impl Into<String>,
        descriptor: EnvironmentDescriptor,
        runtime: PipelineRuntime,
    ) -> Self {
        Self {
            run_id,
            stage: stage.into(),
            descriptor,
            runtime,
        }
    }

    /// The pipeline run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The running stage.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage
    }

    /// Volume layout.
    #[must_use]
    pub fn layout(&self) -> &PersistentLayout {
        &self.runtime.layout
    }

    /// Descriptor as left by every earlier completed stage.
    #[must_use]
    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.descriptor
    }

    /// Descriptor resolved against the process environment.
    #[must_use]
    pub fn resolved_env(&self) -> ResolvedEnv {
        self.descriptor.resolve_with_process_env()
    }

    /// The fetcher.
    #[must_use]
    pub fn fetcher(&self) -> &ResilientFetcher {
        &self.runtime.fetcher
    }

    /// The command runner.
    #[must_use]
    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runtime.runner
    }

    /// The cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.runtime.cancel_token
    }

    /// Returns true if the pipeline was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.runtime.cancel_token.is_cancelled()
    }
}
