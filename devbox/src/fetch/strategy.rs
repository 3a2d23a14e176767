//! Download strategies backed by external tools.

use super::FetchTask;
use crate::config::FetchConfig;
use crate::errors::FetchError;
use crate::process::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::sync::Arc;

/// One way of downloading a file.
#[async_trait]
pub trait FetchStrategy: Send + Sync + std::fmt::Debug {
    /// Strategy name for logs and errors.
    fn name(&self) -> &str;

    /// Returns true if the underlying tool is installed.
    fn is_available(&self) -> bool;

    /// Downloads `task.uri` to `task.destination`.
    async fn fetch(&self, task: &FetchTask) -> Result<(), FetchError>;
}

async fn run_tool(
    runner: &dyn CommandRunner,
    strategy: &str,
    task: &FetchTask,
    spec: CommandSpec,
) -> Result<(), FetchError> {
    runner
        .run_checked(&spec)
        .await
        .map(|_| ())
        .map_err(|e| FetchError::StrategyFailed {
            uri: task.uri.clone(),
            strategy: strategy.to_string(),
            reason: e.to_string(),
        })
}

/// Multi-connection segmented download (`aria2c`).
#[derive(Debug, Clone)]
pub struct SegmentedStrategy {
    runner: Arc<dyn CommandRunner>,
    connections: u32,
}

impl SegmentedStrategy {
    /// Tool name.
    pub const TOOL: &'static str = "aria2c";

    /// Creates the strategy.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, config: &FetchConfig) -> Self {
        Self {
            runner,
            connections: config.connections.max(1),
        }
    }

    /// Builds the command line.
    #[must_use]
    pub fn command(&self, task: &FetchTask) -> CommandSpec {
        let dir = task
            .destination
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        let file = task
            .destination
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        CommandSpec::new(Self::TOOL).args([
            format!("--max-connection-per-server={}", self.connections),
            format!("--split={}", self.connections),
            "--min-split-size=1M".to_string(),
            "--continue=true".to_string(),
            "--allow-overwrite=true".to_string(),
            "--auto-file-renaming=false".to_string(),
            "--console-log-level=warn".to_string(),
            format!("--dir={dir}"),
            format!("--out={file}"),
            task.uri.clone(),
        ])
    }
}

#[async_trait]
impl FetchStrategy for SegmentedStrategy {
    fn name(&self) -> &str {
        Self::TOOL
    }

    fn is_available(&self) -> bool {
        self.runner.is_available(Self::TOOL)
    }

    async fn fetch(&self, task: &FetchTask) -> Result<(), FetchError> {
        run_tool(self.runner.as_ref(), Self::TOOL, task, self.command(task)).await
    }
}

/// Range-resuming client with bounded retries and a fixed delay (`curl`).
#[derive(Debug, Clone)]
pub struct ResumingStrategy {
    runner: Arc<dyn CommandRunner>,
    retries: u32,
    retry_delay_secs: u64,
}

impl ResumingStrategy {
    /// Tool name.
    pub const TOOL: &'static str = "curl";

    /// Creates the strategy.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, config: &FetchConfig) -> Self {
        Self {
            runner,
            retries: config.retries,
            retry_delay_secs: config.retry_delay_secs,
        }
    }

    /// Builds the command line.
    #[must_use]
    pub fn command(&self, task: &FetchTask) -> CommandSpec {
        CommandSpec::new(Self::TOOL).args([
            "--fail".to_string(),
            "--location".to_string(),
            "--silent".to_string(),
            "--show-error".to_string(),
            "--continue-at".to_string(),
            "-".to_string(),
            "--retry".to_string(),
            self.retries.to_string(),
            "--retry-delay".to_string(),
            self.retry_delay_secs.to_string(),
            "--retry-connrefused".to_string(),
            "--output".to_string(),
            task.destination.display().to_string(),
            task.uri.clone(),
        ])
    }
}

#[async_trait]
impl FetchStrategy for ResumingStrategy {
    fn name(&self) -> &str {
        Self::TOOL
    }

    fn is_available(&self) -> bool {
        self.runner.is_available(Self::TOOL)
    }

    async fn fetch(&self, task: &FetchTask) -> Result<(), FetchError> {
        run_tool(self.runner.as_ref(), Self::TOOL, task, self.command(task)).await
    }
}

/// Simpler resuming fallback with bounded retries (`wget`).
#[derive(Debug, Clone)]
pub struct FallbackStrategy {
    runner: Arc<dyn CommandRunner>,
    retries: u32,
    retry_delay_secs: u64,
}

impl FallbackStrategy {
    /// Tool name.
    pub const TOOL: &'static str = "wget";

    /// Creates the strategy.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, config: &FetchConfig) -> Self {
        Self {
            runner,
            retries: config.retries,
            retry_delay_secs: config.retry_delay_secs,
        }
    }

    /// Builds the command line.
    #[must_use]
    pub fn command(&self, task: &FetchTask) -> CommandSpec {
        CommandSpec::new(Self::TOOL).args([
            "--continue".to_string(),
            "--quiet".to_string(),
            format!("--tries={}", self.retries.max(1)),
            format!("--waitretry={}", self.retry_delay_secs),
            format!("--output-document={}", task.destination.display()),
            task.uri.clone(),
        ])
    }
}

#[async_trait]
impl FetchStrategy for FallbackStrategy {
    fn name(&self) -> &str {
        Self::TOOL
    }

    fn is_available(&self) -> bool {
        self.runner.is_available(Self::TOOL)
    }

    async fn fetch(&self, task: &FetchTask) -> Result<(), FetchError> {
        run_tool(self.runner.as_ref(), Self::TOOL, task, self.command(task)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;

    fn task() -> FetchTask {
        FetchTask::new("https://example.invalid/pv.tar.gz", "/vol/downloads/pv.tar.gz")
    }

    #[test]
    fn test_segmented_command() {
        let runner = Arc::new(FakeRunner::new());
        let config = FetchConfig {
            connections: 8,
            ..FetchConfig::default()
        };
        let spec = SegmentedStrategy::new(runner, &config).command(&task());

        assert_eq!(spec.program, "aria2c");
        assert!(spec.args.contains(&"--split=8".to_string()));
        assert!(spec.args.contains(&"--dir=/vol/downloads".to_string()));
        assert!(spec.args.contains(&"--out=pv.tar.gz".to_string()));
    }

    #[test]
    fn test_resuming_command_bounds_retries() {
        let runner = Arc::new(FakeRunner::new());
        let config = FetchConfig {
            retries: 4,
            retry_delay_secs: 7,
            ..FetchConfig::default()
        };
        let args = ResumingStrategy::new(runner, &config).command(&task()).args;

        let retry = args.iter().position(|a| a == "--retry").unwrap();
        assert_eq!(args[retry + 1], "4");
        let delay = args.iter().position(|a| a == "--retry-delay").unwrap();
        assert_eq!(args[delay + 1], "7");
        assert!(args.contains(&"--continue-at".to_string()));
    }

    #[test]
    fn test_fallback_command() {
        let runner = Arc::new(FakeRunner::new());
        let args = FallbackStrategy::new(runner, &FetchConfig::default())
            .command(&task())
            .args;
        assert!(args.contains(&"--tries=5".to_string()));
        assert!(args.contains(&"--output-document=/vol/downloads/pv.tar.gz".to_string()));
    }

    #[tokio::test]
    async fn test_tool_failure_maps_to_strategy_failed() {
        let runner = Arc::new(FakeRunner::new().with_tool("curl"));
        runner.respond("curl", crate::process::CommandOutput::failure(22, "404"));

        let strategy = ResumingStrategy::new(runner.clone(), &FetchConfig::default());
        assert!(strategy.is_available());

        let err = strategy.fetch(&task()).await.unwrap_err();
        assert!(matches!(err, FetchError::StrategyFailed { ref strategy, .. } if strategy == "curl"));
        assert_eq!(runner.calls_to("curl"), 1);
    }
}
