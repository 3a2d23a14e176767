//! Pipeline builder with validation.

use super::{Pipeline, PipelineRuntime};
use crate::errors::PipelineValidationError;
use crate::markers::validate_marker_id;
use crate::stages::Stage;
use std::sync::Arc;

/// Builder for creating validated pipelines.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// The pipeline name.
    name: String,
    /// Stages in declaration order.
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or marker id is empty, invalid, or
    /// already used by an earlier stage.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Result<Self, PipelineValidationError> {
        self.add_stage(stage)?;
        Ok(self)
    }

    /// Appends a stage in place.
    ///
    /// # Errors
    ///
    /// See [`PipelineBuilder::stage`].
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> Result<(), PipelineValidationError> {
        let name = stage.name().to_string();
        let marker = stage.marker_id().to_string();

        if name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name must not be empty"));
        }
        if validate_marker_id(&marker).is_err() {
            return Err(PipelineValidationError::new(format!(
                "Stage '{name}' has invalid marker id '{marker}'"
            ))
            .with_stages(vec![name]));
        }
        if let Some(existing) = self.stages.iter().find(|s| s.name() == name) {
            return Err(PipelineValidationError::new(format!(
                "Duplicate stage name '{}'",
                existing.name()
            ))
            .with_stages(vec![name]));
        }
        if let Some(existing) = self.stages.iter().find(|s| s.marker_id() == marker) {
            return Err(PipelineValidationError::new(format!(
                "Stages '{}' and '{name}' share marker id '{marker}'",
                existing.name()
            ))
            .with_stages(vec![existing.name().to_string(), name]));
        }

        self.stages.push(stage);
        Ok(())
    }

    /// Appends several stages in order.
    ///
    /// # Errors
    ///
    /// Stops at the first rejected stage.
    pub fn stages(
        mut self,
        stages: impl IntoIterator<Item = Arc<dyn Stage>>,
    ) -> Result<Self, PipelineValidationError> {
        for stage in stages {
            self.add_stage(stage)?;
        }
        Ok(self)
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages.
    pub fn build(self, runtime: PipelineRuntime) -> Result<Pipeline, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages"));
        }
        Ok(Pipeline::new(self.name, self.stages, runtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageOutput;
    use crate::stages::FnStage;

    fn stage(name: &str) -> Arc<dyn Stage> {
        Arc::new(FnStage::new(name, |_| StageOutput::ok()))
    }

    #[test]
    fn test_builder_keeps_order() {
        let builder = PipelineBuilder::new("install")
            .stage(stage("a"))
            .unwrap()
            .stages(vec![stage("b"), stage("c")])
            .unwrap();
        assert_eq!(builder.stage_count(), 3);
        assert_eq!(builder.name(), "install");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = PipelineBuilder::new("install")
            .stage(stage("a"))
            .unwrap()
            .stage(stage("a"))
            .unwrap_err();
        assert!(err.message.contains("Duplicate stage name"));
        assert_eq!(err.stages, vec!["a".to_string()]);
    }

    #[test]
    fn test_shared_marker_rejected() {
        let first: Arc<dyn Stage> = Arc::new(FnStage::new("a", |_| StageOutput::ok()).with_marker("m"));
        let second: Arc<dyn Stage> = Arc::new(FnStage::new("b", |_| StageOutput::ok()).with_marker("m"));

        let err = PipelineBuilder::new("install")
            .stages(vec![first, second])
            .unwrap_err();
        assert_eq!(err.stages, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_invalid_marker_rejected() {
        let bad: Arc<dyn Stage> = Arc::new(FnStage::new("a", |_| StageOutput::ok()).with_marker("../a"));
        assert!(PipelineBuilder::new("install").stage(bad).is_err());
    }
}
