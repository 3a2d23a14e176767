//! Testing utilities for devbox pipelines and bring-up.
//!
//! This module provides:
//! - Recording and flaky stages
//! - A scripted identity backend
//! - A fake command runner and a static fetch strategy

mod backend;
mod runner;
mod stages;

pub use backend::ScriptedBackend;
pub use runner::{FakeRunner, StaticStrategy};
pub use stages::{FlakyStage, RecordingStage};

use crate::environment::EnvironmentDescriptor;
use crate::fetch::ResilientFetcher;
use crate::layout::PersistentLayout;
use crate::pipeline::{PipelineRuntime, StageContext};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// A runtime over `root` with a fake runner and no download strategies.
#[must_use]
pub fn test_runtime(root: &Path) -> PipelineRuntime {
    PipelineRuntime::new(
        PersistentLayout::new(root),
        ResilientFetcher::new(Vec::new()),
        Arc::new(FakeRunner::new()),
    )
}

/// A context for running a single stage outside a pipeline.
#[must_use]
pub fn stage_context(root: &Path, stage: &str) -> StageContext {
    StageContext::new(Uuid::new_v4(), stage, EnvironmentDescriptor::new(), test_runtime(root))
}
