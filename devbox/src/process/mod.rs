//! Running external programs.
//!
//! Everything devbox does to the outside world (download tools, archive
//! tools, daemons, key generation) goes through a [`CommandRunner`] so the
//! callers can be exercised without those programs installed.

mod system;

pub use system::SystemRunner;

use crate::environment::ResolvedEnv;
use crate::errors::ProcessError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// A program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Kill the program if it runs longer than this.
    pub timeout: Option<Duration>,
    /// Send stdout and stderr of spawned processes here.
    pub log_file: Option<PathBuf>,
}

impl CommandSpec {
    /// Describes a run of `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Describes running `script` with `sh -c`.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Adds an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds every variable of a resolved descriptor.
    #[must_use]
    pub fn with_resolved_env(mut self, resolved: &ResolvedEnv) -> Self {
        self.env
            .extend(resolved.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the log file for spawned processes.
    #[must_use]
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Renders the command line for logs.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Creates a successful output with the given stdout.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Creates a failed output.
    #[must_use]
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the program exited with status 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a non-zero exit into an error.
    pub fn into_result(self, program: &str) -> Result<Self, ProcessError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProcessError::Exit {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// A running child process.
#[async_trait]
pub trait ChildHandle: Send {
    /// The OS process id, if still known.
    fn id(&self) -> Option<u32>;

    /// Waits for exit and returns the exit code.
    async fn wait(&mut self) -> Result<Option<i32>, ProcessError>;

    /// Kills the process and reaps it.
    async fn kill(&mut self) -> Result<(), ProcessError>;
}

/// Runs programs.
#[async_trait]
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    /// Runs a program to completion and captures its output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;

    /// Starts a long-running program.
    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildHandle>, ProcessError>;

    /// Returns true if `program` can be found.
    fn is_available(&self, program: &str) -> bool;

    /// Runs a program and fails on a non-zero exit.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.run(spec).await?.into_result(&spec.program)
    }
}
