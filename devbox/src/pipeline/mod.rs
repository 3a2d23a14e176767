//! Install pipeline building and execution.
//!
//! A pipeline is a fixed, linear sequence of stages. Each stage consults
//! the marker store, runs its action if needed, appends its environment
//! fragment and only then writes its marker.

mod builder;
mod context;
mod output;
mod runner;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use context::{PipelineRuntime, StageContext};
pub use output::{StageOutput, StageStatus};
pub use runner::{Pipeline, PipelineReport, StageRecord};
