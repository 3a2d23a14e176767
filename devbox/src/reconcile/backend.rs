//! Network identity backend.

use super::credential::Credential;
use super::state::{BackendState, Observation};
use crate::cancellation::Supervisor;
use crate::config::NetworkConfig;
use crate::errors::ProcessError;
use crate::layout::PersistentLayout;
use crate::process::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Task name of the supervised daemon.
pub const DAEMON_TASK: &str = "netid-daemon";

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const AUTH_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything the reconciler needs from the identity service.
#[async_trait]
pub trait IdentityBackend: Send + Sync + std::fmt::Debug {
    /// Service name used in logs and issues.
    fn service(&self) -> &str;

    /// Returns true if the daemon process is already up.
    async fn daemon_running(&self) -> bool;

    /// Starts the daemon under `supervisor`.
    async fn start_daemon(&self, supervisor: &Supervisor) -> Result<(), ProcessError>;

    /// Asks the daemon for its state. An error means it did not answer.
    async fn observe(&self) -> Result<Observation, ProcessError>;

    /// Authenticates with `credential`.
    async fn authenticate(&self, credential: &Credential) -> Result<(), ProcessError>;

    /// Kills a stalled daemon.
    async fn stop_daemon(&self) -> Result<(), ProcessError>;

    /// One-time side effects once connected.
    async fn enable_secondary_access(&self) -> Result<(), ProcessError>;
}

#[derive(Debug, Default, Deserialize)]
struct StatusJson {
    #[serde(rename = "BackendState", default)]
    backend_state: String,
    #[serde(rename = "TailscaleIPs", default)]
    ips: Option<Vec<String>>,
    #[serde(rename = "Self", default)]
    self_node: Option<SelfNode>,
}

#[derive(Debug, Default, Deserialize)]
struct SelfNode {
    #[serde(rename = "TailscaleIPs", default)]
    ips: Option<Vec<String>>,
}

/// Parses `status --json` output. Anything unparseable is `Unknown`.
#[must_use]
pub fn parse_status(text: &str) -> Observation {
    let Ok(status) = serde_json::from_str::<StatusJson>(text) else {
        return Observation::new(BackendState::Unknown);
    };

    let address = status
        .ips
        .filter(|ips| !ips.is_empty())
        .or_else(|| status.self_node.and_then(|node| node.ips))
        .and_then(|ips| ips.into_iter().next());

    Observation {
        backend: BackendState::from_backend_str(&status.backend_state),
        address,
    }
}

/// Drives the daemon and client binaries.
#[derive(Debug, Clone)]
pub struct CliIdentityBackend {
    config: NetworkConfig,
    layout: PersistentLayout,
    runner: Arc<dyn CommandRunner>,
}

impl CliIdentityBackend {
    /// Service name.
    pub const SERVICE: &'static str = "netid";

    /// Creates the backend.
    #[must_use]
    pub fn new(config: NetworkConfig, layout: PersistentLayout, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            layout,
            runner,
        }
    }

    fn client(&self) -> CommandSpec {
        CommandSpec::new(&self.config.client_binary).arg(format!(
            "--socket={}",
            self.layout.netid_socket().path().display()
        ))
    }

    /// Command line of the daemon.
    #[must_use]
    pub fn daemon_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.daemon_binary)
            .arg(format!("--state={}", self.layout.netid_state().path().display()))
            .arg(format!("--socket={}", self.layout.netid_socket().path().display()))
            .args(self.config.daemon_args.iter().cloned())
            .log_file(self.layout.netid_dir().join("daemon.log"))
    }

    /// Command line of the authentication call, key included.
    #[must_use]
    pub fn auth_command(&self, credential: &Credential) -> CommandSpec {
        let mut spec = self
            .client()
            .arg("up")
            .arg(format!("--authkey={}", credential.expose()));
        if let Some(hostname) = &self.config.hostname {
            spec = spec.arg(format!("--hostname={hostname}"));
        }
        spec.timeout(AUTH_TIMEOUT)
    }
}

#[async_trait]
impl IdentityBackend for CliIdentityBackend {
    fn service(&self) -> &str {
        Self::SERVICE
    }

    async fn daemon_running(&self) -> bool {
        if !self.runner.is_available("pgrep") {
            return self.layout.netid_socket().exists();
        }
        let spec = CommandSpec::new("pgrep").arg("-x").arg(&self.config.daemon_binary);
        matches!(self.runner.run(&spec).await, Ok(out) if out.is_success())
    }

    async fn start_daemon(&self, supervisor: &Supervisor) -> Result<(), ProcessError> {
        std::fs::create_dir_all(self.layout.netid_dir()).map_err(|e| ProcessError::Spawn {
            program: self.config.daemon_binary.clone(),
            reason: e.to_string(),
        })?;
        let child = self.runner.spawn(&self.daemon_command()).await?;
        info!(service = Self::SERVICE, pid = ?child.id(), "daemon started");
        supervisor.supervise_child(DAEMON_TASK, child);
        Ok(())
    }

    async fn observe(&self) -> Result<Observation, ProcessError> {
        let spec = self
            .client()
            .arg("status")
            .arg("--json")
            .timeout(STATUS_TIMEOUT);
        let output = self.runner.run(&spec).await?;
        // A stopped node exits non-zero but still prints its state.
        if output.stdout.trim().is_empty() {
            return Err(ProcessError::Exit {
                program: spec.program,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        let observation = parse_status(&output.stdout);
        debug!(service = Self::SERVICE, backend = ?observation.backend, "observed");
        Ok(observation)
    }

    async fn authenticate(&self, credential: &Credential) -> Result<(), ProcessError> {
        self.runner
            .run_checked(&self.auth_command(credential))
            .await
            .map(|_| ())
    }

    async fn stop_daemon(&self) -> Result<(), ProcessError> {
        let spec = CommandSpec::new("pkill").arg("-x").arg(&self.config.daemon_binary);
        let output = self.runner.run(&spec).await?;
        // pkill exits 1 when nothing matched.
        if output.is_success() || output.code == Some(1) {
            Ok(())
        } else {
            output.into_result("pkill").map(|_| ())
        }
    }

    async fn enable_secondary_access(&self) -> Result<(), ProcessError> {
        if self.config.secondary_access.is_empty() {
            return Ok(());
        }
        let spec = self
            .client()
            .args(self.config.secondary_access.iter().cloned())
            .timeout(STATUS_TIMEOUT);
        self.runner.run_checked(&spec).await.map(|_| ())
    }
}
