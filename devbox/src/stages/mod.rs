//! Stage trait and implementations.
//!
//! Stages are the named, ordered units of install work a pipeline runs.

mod command;

pub use command::CommandStage;

use crate::pipeline::{StageContext, StageOutput};
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Returns the id of the marker recording completion.
    fn marker_id(&self) -> &str {
        self.name()
    }

    /// Executes the stage.
    ///
    /// Returning a failed output aborts the pipeline and leaves the marker
    /// absent.
    async fn execute(&self, ctx: &StageContext) -> StageOutput;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    name: String,
    marker: Option<String>,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            marker: None,
            func,
        }
    }

    /// Uses a marker id different from the name.
    #[must_use]
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("marker", &self.marker)
            .finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn marker_id(&self) -> &str {
        self.marker.as_deref().unwrap_or(&self.name)
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        (self.func)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvFragment;
    use crate::testing::stage_context;

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("gcc", |ctx| {
            StageOutput::ok_with_env(EnvFragment::new(ctx.stage_name()).with("CC", "gcc"))
        });

        assert_eq!(stage.name(), "gcc");
        assert_eq!(stage.marker_id(), "gcc");

        let dir = tempfile::tempdir().unwrap();
        let output = stage.execute(&stage_context(dir.path(), "gcc")).await;
        assert!(output.is_success());
        assert_eq!(output.env.unwrap().source, "gcc");
    }

    #[test]
    fn test_fn_stage_marker_override() {
        let stage = FnStage::new("paraview", |_| StageOutput::ok()).with_marker("paraview-5.12");
        assert_eq!(stage.marker_id(), "paraview-5.12");
    }
}
