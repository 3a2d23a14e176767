//! Integration tests for restart-safe pipeline execution.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::environment::EnvFragment;
    use crate::errors::DevboxError;
    use crate::events::{names, CollectingEventSink};
    use crate::markers::FsMarkerStore;
    use crate::markers::MarkerStore;
    use crate::pipeline::{Pipeline, PipelineBuilder, PipelineRuntime, StageOutput};
    use crate::stages::{FnStage, Stage};
    use crate::testing::{test_runtime, FlakyStage, RecordingStage};
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::Arc;

    fn pipeline(runtime: PipelineRuntime, stages: Vec<Arc<dyn Stage>>) -> Pipeline {
        PipelineBuilder::new("install")
            .stages(stages)
            .unwrap()
            .build(runtime)
            .unwrap()
    }

    async fn marker_ids(root: &Path) -> Vec<String> {
        let store = FsMarkerStore::new(root.join("markers"));
        store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    #[tokio::test]
    async fn test_second_run_executes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(RecordingStage::new("a").with_env("A", "1"));
        let b = Arc::new(RecordingStage::new("b"));

        let stages: Vec<Arc<dyn Stage>> = vec![a.clone(), b.clone()];
        let first = pipeline(test_runtime(dir.path()), stages.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(first.executed(), vec!["a", "b"]);

        let second = pipeline(test_runtime(dir.path()), stages).run().await.unwrap();
        assert!(second.executed().is_empty());
        assert_eq!(second.skipped(), vec!["a", "b"]);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);

        let descriptor = test_runtime(dir.path()).descriptor.load().await.unwrap();
        assert_eq!(descriptor.sources(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_failed_stage_resumes_on_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(RecordingStage::new("A").with_env("A_HOME", "/opt/a"));
        let b = FlakyStage::new("B", 1).with_env("B_HOME", "/opt/b");
        let c = Arc::new(RecordingStage::new("C").with_env("C_HOME", "/opt/c"));
        let stages: Vec<Arc<dyn Stage>> = vec![a.clone(), Arc::new(b.clone()), c.clone()];

        let err = pipeline(test_runtime(dir.path()), stages.clone())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.failed_stage(), Some("B"));
        assert_eq!(marker_ids(dir.path()).await, vec!["A"]);
        assert_eq!(c.calls(), 0);

        let report = pipeline(test_runtime(dir.path()), stages).run().await.unwrap();
        assert_eq!(report.skipped(), vec!["A"]);
        assert_eq!(report.executed(), vec!["B", "C"]);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);
        assert_eq!(marker_ids(dir.path()).await, vec!["A", "B", "C"]);

        let descriptor = test_runtime(dir.path()).descriptor.load().await.unwrap();
        assert_eq!(descriptor.sources(), vec!["A", "B", "C"]);
        assert_eq!(c.seen_sources(), vec![vec!["A".to_string(), "B".to_string()]]);
    }

    #[tokio::test]
    async fn test_later_fragment_wins_for_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(RecordingStage::new("first").with_env("A", "1")),
            Arc::new(RecordingStage::new("second").with_env("A", "2")),
        ];

        pipeline(test_runtime(dir.path()), stages).run().await.unwrap();

        let descriptor = test_runtime(dir.path()).descriptor.load().await.unwrap();
        assert_eq!(descriptor.get("A"), Some("2".to_string()));
        let rendered = std::fs::read_to_string(dir.path().join("env").join("environment.sh")).unwrap();
        let first = rendered.find("export A=\"1\"").unwrap();
        let second = rendered.find("export A=\"2\"").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_fragment_source_is_retagged_to_stage_name() {
        let dir = tempfile::tempdir().unwrap();
        let stage = FnStage::new("tools", |_ctx| {
            StageOutput::ok_with_env(EnvFragment::new("whatever").with("TOOLS", "/opt/tools"))
        });

        pipeline(test_runtime(dir.path()), vec![Arc::new(stage)])
            .run()
            .await
            .unwrap();

        let descriptor = test_runtime(dir.path()).descriptor.load().await.unwrap();
        assert_eq!(descriptor.sources(), vec!["tools"]);
    }

    #[tokio::test]
    async fn test_failure_leaves_descriptor_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(FlakyStage::new("only", 1).with_env("X", "1"))];

        pipeline(test_runtime(dir.path()), stages).run().await.unwrap_err();

        let descriptor = test_runtime(dir.path()).descriptor.load().await.unwrap();
        assert!(descriptor.is_empty());
        assert!(marker_ids(dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stage_force_reruns_completed_stage() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(RecordingStage::new("a").with_env("A", "1"));
        let b = Arc::new(RecordingStage::new("b"));
        let stages: Vec<Arc<dyn Stage>> = vec![a.clone(), b.clone()];

        let install = pipeline(test_runtime(dir.path()), stages);
        install.run().await.unwrap();

        let skipped = install.run_stage("a", false).await.unwrap();
        assert_eq!(skipped.skipped(), vec!["a"]);
        assert_eq!(a.calls(), 1);

        let forced = install.run_stage("a", true).await.unwrap();
        assert_eq!(forced.executed(), vec!["a"]);
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 1);

        let descriptor = install.runtime().descriptor.load().await.unwrap();
        assert_eq!(descriptor.sources(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_resume_after_crash_between_fragment_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(RecordingStage::new("a").with_env("PATH", "/opt/a/bin:$PATH"));
        let b = Arc::new(RecordingStage::new("b").with_env("B", "1"));
        let runtime = test_runtime(dir.path());

        // A run that appended a's fragment but died before its marker.
        runtime
            .descriptor
            .append(&EnvFragment::new("a").with("PATH", "/opt/a/bin:$PATH"))
            .await
            .unwrap();

        let stages: Vec<Arc<dyn Stage>> = vec![a.clone(), b.clone()];
        let report = pipeline(runtime, stages).run().await.unwrap();
        assert_eq!(report.executed(), vec!["a", "b"]);
        assert_eq!(marker_ids(dir.path()).await, vec!["a", "b"]);

        let descriptor = test_runtime(dir.path()).descriptor.load().await.unwrap();
        assert_eq!(descriptor.sources(), vec!["a", "b"]);
        assert_eq!(b.seen_sources(), vec![vec!["a".to_string()]]);
    }

    #[tokio::test]
    async fn test_multiline_value_fails_stage_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let stage = FnStage::new("banner", |ctx| {
            StageOutput::ok_with_env(EnvFragment::new(ctx.stage_name()).with("MOTD", "line1\nline2"))
        });

        let install = pipeline(test_runtime(dir.path()), vec![Arc::new(stage)]);
        let err = install.run().await.unwrap_err();
        assert_eq!(err.failed_stage(), Some("banner"));
        assert!(marker_ids(dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stage_unknown_name() {
        let dir = tempfile::tempdir().unwrap();
        let install = pipeline(
            test_runtime(dir.path()),
            vec![Arc::new(RecordingStage::new("a"))],
        );

        let err = install.run_stage("zzz", false).await.unwrap_err();
        assert!(matches!(err, DevboxError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_stages() {
        let dir = tempfile::tempdir().unwrap();
        let token = Arc::new(CancellationToken::new());
        let first = FnStage::new("first", |ctx| {
            ctx.cancel_token().cancel("SIGTERM");
            StageOutput::ok()
        });
        let second = Arc::new(RecordingStage::new("second"));

        let runtime = test_runtime(dir.path()).with_cancel_token(token.clone());
        let err = pipeline(runtime, vec![Arc::new(first), second.clone()])
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, DevboxError::Cancelled(ref reason) if reason == "SIGTERM"));
        assert_eq!(second.calls(), 0);
        assert_eq!(marker_ids(dir.path()).await, vec!["first"]);
    }

    #[tokio::test]
    async fn test_cancelled_stage_output_leaves_marker_absent() {
        let dir = tempfile::tempdir().unwrap();
        let stage = FnStage::new("slow", |_ctx| StageOutput::cancel("interrupted"));

        let err = pipeline(test_runtime(dir.path()), vec![Arc::new(stage)])
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, DevboxError::Cancelled(_)));
        assert!(marker_ids(dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_custom_marker_id_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let stage = FnStage::new("compilers", |_ctx| StageOutput::ok()).with_marker("nvhpc-24.5");

        pipeline(test_runtime(dir.path()), vec![Arc::new(stage)])
            .run()
            .await
            .unwrap();

        assert_eq!(marker_ids(dir.path()).await, vec!["nvhpc-24.5"]);
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(RecordingStage::new("a")),
            Arc::new(FlakyStage::new("b", 1)),
        ];

        let runtime = test_runtime(dir.path()).with_event_sink(sink.clone());
        pipeline(runtime.clone(), stages.clone()).run().await.unwrap_err();
        assert_eq!(
            sink.names(),
            vec![
                names::PIPELINE_STARTED,
                names::STAGE_STARTED,
                names::STAGE_COMPLETED,
                names::STAGE_STARTED,
                names::STAGE_FAILED,
                names::PIPELINE_FAILED,
            ]
        );

        sink.clear();
        pipeline(runtime, stages).run().await.unwrap();
        assert_eq!(
            sink.names(),
            vec![
                names::PIPELINE_STARTED,
                names::STAGE_SKIPPED,
                names::STAGE_STARTED,
                names::STAGE_COMPLETED,
                names::PIPELINE_COMPLETED,
            ]
        );
    }
}
