//! Sequential, marker-aware pipeline execution.

use super::{PipelineRuntime, StageContext, StageStatus};
use crate::environment::EnvironmentDescriptor;
use crate::errors::{DevboxError, PipelineValidationError, Result};
use crate::events::names;
use crate::stages::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What happened to one stage during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub name: String,
    /// Marker id.
    pub marker_id: String,
    /// `Ok` if the action ran, `Skip` if the marker was present.
    pub status: StageStatus,
    /// Action duration in milliseconds (zero when skipped).
    pub duration_ms: f64,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Per-stage records in execution order.
    pub stages: Vec<StageRecord>,
    /// Total run time in milliseconds.
    pub duration_ms: f64,
}

impl PipelineReport {
    fn new(run_id: Uuid, pipeline: &str) -> Self {
        Self {
            run_id,
            pipeline: pipeline.to_string(),
            started_at: Utc::now(),
            stages: Vec::new(),
            duration_ms: 0.0,
        }
    }

    /// Names of stages whose action ran.
    #[must_use]
    pub fn executed(&self) -> Vec<&str> {
        self.names_with(StageStatus::Ok)
    }

    /// Names of stages skipped because their marker existed.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.names_with(StageStatus::Skip)
    }

    fn names_with(&self, status: StageStatus) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.name.as_str())
            .collect()
    }
}

/// An ordered list of stages bound to a runtime.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    runtime: PipelineRuntime,
}

impl Pipeline {
    pub(crate) fn new(name: String, stages: Vec<Arc<dyn Stage>>, runtime: PipelineRuntime) -> Self {
        Self {
            name,
            stages,
            runtime,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Returns the runtime.
    #[must_use]
    pub fn runtime(&self) -> &PipelineRuntime {
        &self.runtime
    }

    /// Runs every stage in order.
    ///
    /// Stages whose marker exists are skipped. The first failure aborts the
    /// run and is returned; its marker stays absent so the next run resumes
    /// there.
    pub async fn run(&self) -> Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let mut report = PipelineReport::new(run_id, &self.name);

        info!(pipeline = %self.name, %run_id, stages = self.stages.len(), "pipeline started");
        self.emit(
            names::PIPELINE_STARTED,
            json!({"pipeline": self.name, "run_id": run_id, "stages": self.stage_names()}),
        )
        .await;

        let outcome = self.run_stages(run_id, &self.stages, false, &mut report).await;
        report.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.finish(outcome, report).await
    }

    /// Runs one stage by name. With `force` the marker is ignored.
    pub async fn run_stage(&self, name: &str, force: bool) -> Result<PipelineReport> {
        let stage = self
            .stages
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| {
                PipelineValidationError::new(format!("Unknown stage '{name}'"))
                    .with_stages(vec![name.to_string()])
            })?;

        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let mut report = PipelineReport::new(run_id, &self.name);

        let position = self.stages.iter().position(|s| s.name() == name).unwrap_or(0);
        for earlier in &self.stages[..position] {
            if !self.runtime.markers.is_complete(earlier.marker_id()).await? {
                warn!(stage = %name, earlier = %earlier.name(), "running stage before an incomplete earlier stage");
            }
        }

        info!(pipeline = %self.name, %run_id, stage = %name, force, "single stage run");
        self.emit(
            names::PIPELINE_STARTED,
            json!({"pipeline": self.name, "run_id": run_id, "stages": [name], "force": force}),
        )
        .await;

        let outcome = self.run_stages(run_id, &[stage], force, &mut report).await;
        report.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.finish(outcome, report).await
    }

    async fn run_stages(
        &self,
        run_id: Uuid,
        stages: &[Arc<dyn Stage>],
        force: bool,
        report: &mut PipelineReport,
    ) -> Result<()> {
        let mut descriptor = self.runtime.descriptor.load().await?;

        for stage in stages {
            if let Some(reason) = self.runtime.cancel_token.reason() {
                warn!(pipeline = %self.name, stage = %stage.name(), %reason, "pipeline cancelled");
                return Err(DevboxError::Cancelled(reason));
            }
            let record = self.run_one(run_id, stage, force, &mut descriptor).await?;
            report.stages.push(record);
        }
        Ok(())
    }

    async fn run_one(
        &self,
        run_id: Uuid,
        stage: &Arc<dyn Stage>,
        force: bool,
        descriptor: &mut EnvironmentDescriptor,
    ) -> Result<StageRecord> {
        let name = stage.name().to_string();
        let marker_id = stage.marker_id().to_string();
        let markers = &self.runtime.markers;

        let complete = markers.is_complete(&marker_id).await?;
        if complete && !force {
            info!(stage = %name, marker = %marker_id, "stage already complete, skipping");
            self.emit(names::STAGE_SKIPPED, json!({"stage": name, "marker": marker_id}))
                .await;
            return Ok(StageRecord {
                name,
                marker_id,
                status: StageStatus::Skip,
                duration_ms: 0.0,
            });
        }

        info!(stage = %name, "stage started");
        self.emit(names::STAGE_STARTED, json!({"stage": name, "run_id": run_id}))
            .await;

        let ctx = StageContext::new(run_id, &name, descriptor.clone(), self.runtime.clone());
        let start = Instant::now();
        let output = stage.execute(&ctx).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        match output.status {
            StageStatus::Ok | StageStatus::Skip => {}
            StageStatus::Cancel => {
                let reason = output.error.unwrap_or_else(|| "stage cancelled".to_string());
                warn!(stage = %name, %reason, "stage cancelled");
                return Err(DevboxError::Cancelled(reason));
            }
            StageStatus::Fail => {
                let message = output.error.unwrap_or_else(|| "stage failed".to_string());
                error!(stage = %name, error = %message, duration_ms, "stage failed");
                self.emit(names::STAGE_FAILED, json!({"stage": name, "error": message}))
                    .await;
                return Err(DevboxError::stage_failed(name, message));
            }
        }

        // The fragment is durable before the marker. A run that died between
        // the two leaves this exact block last in the descriptor, so the
        // resumed run does not append it again.
        if let Some(mut fragment) = output.env.filter(|f| !f.is_empty()) {
            fragment.source.clone_from(&name);
            if !complete && descriptor.fragments().last() == Some(&fragment) {
                info!(stage = %name, "fragment already recorded by an interrupted run");
            } else {
                self.runtime.descriptor.append(&fragment).await?;
                descriptor.append_fragment(fragment);
            }
        }

        let marker = markers.mark_complete(&marker_id).await?;
        info!(stage = %name, marker = %marker_id, duration_ms, "stage completed");
        self.emit(
            names::STAGE_COMPLETED,
            json!({"stage": name, "marker": marker_id, "completed_at": marker.completed_at, "duration_ms": duration_ms}),
        )
        .await;

        Ok(StageRecord {
            name,
            marker_id,
            status: StageStatus::Ok,
            duration_ms,
        })
    }

    async fn finish(&self, outcome: Result<()>, report: PipelineReport) -> Result<PipelineReport> {
        match outcome {
            Ok(()) => {
                info!(
                    pipeline = %self.name,
                    executed = report.executed().len(),
                    skipped = report.skipped().len(),
                    duration_ms = report.duration_ms,
                    "pipeline completed"
                );
                self.emit(
                    names::PIPELINE_COMPLETED,
                    json!({"pipeline": self.name, "run_id": report.run_id, "executed": report.executed(), "skipped": report.skipped()}),
                )
                .await;
                Ok(report)
            }
            Err(e) => {
                error!(pipeline = %self.name, error = %e, "pipeline failed");
                self.emit(
                    names::PIPELINE_FAILED,
                    json!({"pipeline": self.name, "run_id": report.run_id, "stage": e.failed_stage(), "error": e.to_string()}),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn emit(&self, event: &str, data: serde_json::Value) {
        self.runtime.event_sink.emit(event, Some(data)).await;
    }
}
