//! Stages declared in configuration.

use super::Stage;
use crate::config::StageConfig;
use crate::environment::EnvFragment;
use crate::errors::{DevboxError, Result};
use crate::fetch::{extract_archive, ArchiveKind, FetchTask};
use crate::pipeline::{StageContext, StageOutput};
use crate::process::CommandSpec;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A stage built from a `[[stages]]` entry.
///
/// Runs, in order: the optional download and extraction, every shell
/// command with the resolved environment descriptor applied, and the
/// `expects` check. On success the configured entries become the stage's
/// environment fragment.
#[derive(Debug, Clone)]
pub struct CommandStage {
    config: StageConfig,
}

impl CommandStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(config: StageConfig) -> Self {
        Self { config }
    }

    /// Builds one stage per declaration, preserving order.
    #[must_use]
    pub fn from_configs(configs: &[StageConfig]) -> Vec<Arc<dyn Stage>> {
        configs
            .iter()
            .map(|c| Arc::new(Self::new(c.clone())) as Arc<dyn Stage>)
            .collect()
    }

    /// The declaration.
    #[must_use]
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    fn fragment(&self) -> EnvFragment {
        EnvFragment::from_entries(&self.config.name, &self.config.env)
    }

    fn resolve_path(ctx: &StageContext, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            ctx.layout().root().join(path)
        }
    }

    async fn run(&self, ctx: &StageContext) -> Result<Option<EnvFragment>> {
        let name = &self.config.name;
        let mut workdir = self
            .config
            .workdir
            .as_deref()
            .map(|p| Self::resolve_path(ctx, p));

        if let Some(fetch) = &self.config.fetch {
            let destination = ctx
                .layout()
                .downloads_dir()
                .path()
                .join(fetch.resolved_file_name());
            if fetch.extract_to.is_some() {
                ArchiveKind::from_path(&destination)?;
            }
            let mut task = FetchTask::new(&fetch.uri, &destination);
            if let Some(digest) = &fetch.sha256 {
                task = task.with_sha256(digest);
            }
            ctx.fetcher().fetch(&task).await?;

            if let Some(target) = &fetch.extract_to {
                let target = Self::resolve_path(ctx, target);
                extract_archive(&destination, &target, ctx.runner().as_ref()).await?;
                workdir.get_or_insert(target);
            }
        }

        // Commands see this stage's own entries on top of earlier stages.
        let fragment = self.fragment();
        let mut descriptor = ctx.descriptor().clone();
        descriptor.append_fragment(fragment.clone());
        let resolved = descriptor.resolve_with_process_env();
        let cwd = workdir.unwrap_or_else(|| ctx.layout().root().to_path_buf());

        for (index, command) in self.config.commands.iter().enumerate() {
            if let Some(reason) = ctx.cancel_token().reason() {
                return Err(DevboxError::Cancelled(reason));
            }
            info!(stage = %name, step = index + 1, command = %command, "running command");
            let spec = CommandSpec::shell(command)
                .with_resolved_env(&resolved)
                .current_dir(&cwd);
            let output = ctx.runner().run_checked(&spec).await?;
            debug!(stage = %name, stdout = %output.stdout.trim_end(), "command finished");
        }

        let missing: Vec<String> = self
            .config
            .expects
            .iter()
            .map(|p| Self::resolve_path(ctx, p))
            .filter(|p| p.symlink_metadata().is_err())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(DevboxError::stage_failed(
                name,
                format!("expected output missing: {}", missing.join(", ")),
            ));
        }

        Ok((!fragment.is_empty()).then_some(fragment))
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn marker_id(&self) -> &str {
        self.config.marker_id()
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        match self.run(ctx).await {
            Ok(Some(fragment)) => StageOutput::ok_with_env(fragment),
            Ok(None) => StageOutput::ok(),
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvEntry, StageFetchConfig};
    use crate::environment::EnvironmentDescriptor;
    use crate::fetch::{FetchStrategy, ResilientFetcher};
    use crate::pipeline::{PipelineRuntime, StageStatus};
    use crate::process::SystemRunner;
    use crate::testing::{FakeRunner, StaticStrategy};
    use crate::layout::PersistentLayout;
    use uuid::Uuid;

    fn stage_config(name: &str) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            marker: None,
            fetch: None,
            commands: Vec::new(),
            workdir: None,
            env: Vec::new(),
            expects: Vec::new(),
        }
    }

    fn context(root: &Path, runner: Arc<dyn crate::process::CommandRunner>, descriptor: EnvironmentDescriptor) -> StageContext {
        let fetcher = ResilientFetcher::new(vec![
            Arc::new(StaticStrategy::writing("curl", b"payload")) as Arc<dyn FetchStrategy>,
        ]);
        let runtime = PipelineRuntime::new(PersistentLayout::new(root), fetcher, runner);
        StageContext::new(Uuid::new_v4(), "under-test", descriptor, runtime)
    }

    #[tokio::test]
    async fn test_commands_see_descriptor_and_own_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stage_config("palabos");
        config.env = vec![EnvEntry {
            key: "PALABOS_ROOT".into(),
            value: "$CFD_HOME/palabos".into(),
        }];
        config.commands = vec!["printf '%s|%s' \"$CFD_HOME\" \"$PALABOS_ROOT\" > out.txt".into()];
        config.expects = vec![PathBuf::from("out.txt")];

        let descriptor = EnvironmentDescriptor::from_fragments(vec![
            EnvFragment::new("base").with("CFD_HOME", "/opt/cfd"),
        ]);
        let ctx = context(dir.path(), Arc::new(SystemRunner::new()), descriptor);

        let output = CommandStage::new(config).execute(&ctx).await;
        assert!(output.is_success(), "{:?}", output.error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "/opt/cfd|/opt/cfd/palabos"
        );
        assert_eq!(output.env.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_command_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stage_config("broken");
        config.commands = vec!["exit 3".into(), "touch never".into()];

        let ctx = context(dir.path(), Arc::new(SystemRunner::new()), EnvironmentDescriptor::new());
        let output = CommandStage::new(config).execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Fail);
        assert!(!dir.path().join("never").exists());
    }

    #[tokio::test]
    async fn test_missing_expected_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stage_config("gcc");
        config.expects = vec![dir.path().join("bin/gcc")];

        let ctx = context(dir.path(), Arc::new(FakeRunner::new()), EnvironmentDescriptor::new());
        let output = CommandStage::new(config).execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Fail);
        assert!(output.error.unwrap().contains("expected output missing"));
    }

    #[tokio::test]
    async fn test_fetch_then_commands_run_in_extract_dir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new().with_tool("tar"));
        let mut config = stage_config("paraview");
        config.fetch = Some(StageFetchConfig {
            uri: "https://example.invalid/pv.tar.xz".into(),
            file_name: None,
            sha256: None,
            extract_to: Some(PathBuf::from("src/pv")),
        });
        config.commands = vec!["./configure".into()];

        let ctx = context(dir.path(), runner.clone(), EnvironmentDescriptor::new());
        let output = CommandStage::new(config).execute(&ctx).await;
        assert!(output.is_success(), "{:?}", output.error);

        assert!(dir.path().join("downloads/pv.tar.xz").exists());
        let calls = runner.calls();
        assert_eq!(calls[0].program, "tar");
        assert_eq!(calls[1].program, "sh");
        assert_eq!(calls[1].cwd, Some(dir.path().join("src/pv")));
    }

    #[tokio::test]
    async fn test_unknown_archive_suffix_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = stage_config("odd");
        config.fetch = Some(StageFetchConfig {
            uri: "https://example.invalid/tool.rar".into(),
            file_name: None,
            sha256: None,
            extract_to: Some(PathBuf::from("tool")),
        });

        let ctx = context(dir.path(), Arc::new(FakeRunner::new()), EnvironmentDescriptor::new());
        let output = CommandStage::new(config).execute(&ctx).await;
        assert_eq!(output.status, StageStatus::Fail);
        assert!(output.error.unwrap().contains("unsupported"));
        assert!(!dir.path().join("downloads/tool.rar").exists());
    }
}
