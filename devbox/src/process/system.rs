//! Runner backed by real OS processes.

use super::{ChildHandle, CommandOutput, CommandRunner, CommandSpec};
use crate::errors::ProcessError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Runs programs with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        command
    }

    fn spawn_error(spec: &CommandSpec, e: &std::io::Error) -> ProcessError {
        ProcessError::Spawn {
            program: spec.program.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        debug!(program = %spec.program, args = spec.args.len(), "running");
        let mut command = Self::command(spec);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = command.spawn().map_err(|e| Self::spawn_error(spec, &e))?;
        let waited = child.wait_with_output();

        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, waited).await {
                Ok(result) => result,
                // Dropping the future drops the child, which kills it.
                Err(_) => {
                    return Err(ProcessError::Timeout {
                        program: spec.program.clone(),
                        seconds: limit.as_secs(),
                    })
                }
            },
            None => waited.await,
        }
        .map_err(|e| Self::spawn_error(spec, &e))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildHandle>, ProcessError> {
        debug!(program = %spec.program, args = spec.args.len(), "spawning");
        let mut command = Self::command(spec);

        match &spec.log_file {
            Some(path) => {
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| Self::spawn_error(spec, &e))?;
                let log_err = log.try_clone().map_err(|e| Self::spawn_error(spec, &e))?;
                command.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = command.spawn().map_err(|e| Self::spawn_error(spec, &e))?;
        Ok(Box::new(SystemChild {
            program: spec.program.clone(),
            child,
        }))
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

struct SystemChild {
    program: String,
    child: Child,
}

#[async_trait]
impl ChildHandle for SystemChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>, ProcessError> {
        let status = self.child.wait().await.map_err(|e| ProcessError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.child.kill().await.map_err(|e| ProcessError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_captures_output() {
        let runner = SystemRunner::new();
        let output = runner
            .run(&CommandSpec::shell("printf hello; printf oops >&2; exit 3"))
            .await
            .unwrap();

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "oops");
    }

    #[tokio::test]
    async fn test_run_applies_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SystemRunner::new();
        let output = runner
            .run_checked(
                &CommandSpec::shell("printf '%s' \"$GREETING\"; pwd >/dev/null")
                    .env("GREETING", "hi")
                    .current_dir(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "hi");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let runner = SystemRunner::new();
        let err = runner
            .run(&CommandSpec::new("sleep").arg("5").timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = SystemRunner::new();
        assert!(!runner.is_available("definitely-not-a-real-tool-xyz"));
        assert!(runner.is_available("sh"));

        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-tool-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_spawn_and_kill() {
        let runner = SystemRunner::new();
        let mut child = runner.spawn(&CommandSpec::new("sleep").arg("30")).await.unwrap();
        assert!(child.id().is_some());
        child.kill().await.unwrap();
    }
}
