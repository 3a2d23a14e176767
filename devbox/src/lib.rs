//! # Devbox
//!
//! Restart-safe provisioning and bring-up for persistent development
//! sandboxes.
//!
//! Devbox covers two phases of a sandbox's life:
//!
//! - **Install**: an ordered pipeline of heavyweight stages (compilers,
//!   libraries, servers). Each stage runs at most once per volume: a
//!   completion marker is written only after the stage's work and its
//!   environment fragment are durable, so an interrupted install resumes at
//!   the first incomplete stage.
//! - **Bring-up**: on every container start, repair volume ownership, load
//!   the environment descriptor, then reconcile the network identity and
//!   remote-access services against persisted state. Bring-up never aborts
//!   the container: problems are reported as [`errors::RuntimeIssue`]s and a
//!   background watcher keeps reconciling after the foreground sequence
//!   returns.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use devbox::prelude::*;
//!
//! let config = DevboxConfig::load(None)?;
//! let runtime = PipelineRuntime::from_config(&config, Arc::new(SystemRunner::new()));
//! let pipeline = PipelineBuilder::new("install")
//!     .stages(CommandStage::from_configs(&config.stages))?
//!     .build(runtime)?;
//!
//! let report = pipeline.run().await?;
//! println!("executed {:?}, skipped {:?}", report.executed(), report.skipped());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod environment;
pub mod errors;
pub mod events;
pub mod fetch;
pub mod layout;
pub mod markers;
pub mod observability;
pub mod permissions;
pub mod pipeline;
pub mod process;
pub mod reconcile;
pub mod session;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{CancellationToken, ShutdownReport, Supervisor};
    pub use crate::config::{DevboxConfig, StageConfig};
    pub use crate::environment::{DescriptorFile, EnvFragment, EnvironmentDescriptor, ResolvedEnv};
    pub use crate::errors::{DevboxError, PipelineValidationError, Result, RuntimeIssue};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::fetch::{FetchTask, ResilientFetcher};
    pub use crate::layout::{PersistedPath, PersistentLayout, StateClass};
    pub use crate::markers::{FsMarkerStore, MarkerStore};
    pub use crate::pipeline::{
        Pipeline, PipelineBuilder, PipelineReport, PipelineRuntime, StageContext, StageOutput,
        StageStatus,
    };
    pub use crate::process::{CommandRunner, CommandSpec, SystemRunner};
    pub use crate::session::{bring_up, Session};
    pub use crate::stages::{CommandStage, FnStage, Stage};
    pub use std::sync::Arc;
}
