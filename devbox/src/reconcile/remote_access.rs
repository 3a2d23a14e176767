//! Remote-access daemon bring-up.
//!
//! Host keys are durable and reused; the daemon configuration is transient
//! and rendered in full from a fixed template on every start. A failed
//! pre-flight check gets one repair attempt before the final check.

use crate::cancellation::Supervisor;
use crate::config::RemoteAccessConfig;
use crate::errors::RuntimeIssue;
use crate::layout::PersistentLayout;
use crate::process::{CommandRunner, CommandSpec};
use std::fmt::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tracing::{info, warn};

/// Service name.
pub const SERVICE: &str = "ssh";
/// Task name of the supervised daemon.
pub const SSHD_TASK: &str = "sshd";

/// Result of [`RemoteAccessService::bring_up`].
#[derive(Debug, Default)]
pub struct RemoteAccessReport {
    /// True if the daemon was started.
    pub started: bool,
    /// Key types generated on this start.
    pub generated_keys: Vec<String>,
    /// True if the repair step ran.
    pub repaired: bool,
    /// Fail-soft problems.
    pub issues: Vec<RuntimeIssue>,
}

/// The remote-access daemon.
#[derive(Debug, Clone)]
pub struct RemoteAccessService {
    config: RemoteAccessConfig,
    layout: PersistentLayout,
    runner: Arc<dyn CommandRunner>,
}

impl RemoteAccessService {
    /// Creates the service.
    #[must_use]
    pub fn new(config: RemoteAccessConfig, layout: PersistentLayout, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            layout,
            runner,
        }
    }

    /// Renders the daemon configuration for the host keys present on disk.
    #[must_use]
    pub fn render_config(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Rendered by devbox on every start. Local edits are overwritten.");
        let _ = writeln!(out, "Port {}", self.config.port);
        let _ = writeln!(out, "ListenAddress {}", self.config.listen_address);
        for key_type in &self.config.key_types {
            let key = self.layout.ssh_host_key(key_type);
            if key.exists() {
                let _ = writeln!(out, "HostKey {}", key.path().display());
            }
        }
        let _ = writeln!(out, "PidFile {}", self.layout.sshd_pid().path().display());
        let _ = writeln!(out, "PermitRootLogin prohibit-password");
        let _ = writeln!(
            out,
            "PasswordAuthentication {}",
            if self.config.password_authentication { "yes" } else { "no" }
        );
        let _ = writeln!(out, "PubkeyAuthentication yes");
        let _ = writeln!(out, "AuthorizedKeysFile .ssh/authorized_keys");
        let _ = writeln!(out, "UsePAM no");
        let _ = writeln!(out, "PrintMotd no");
        let _ = writeln!(out, "Subsystem sftp internal-sftp");
        out
    }

    /// Reuses or generates host keys, validates and starts the daemon.
    pub async fn bring_up(&self, supervisor: &Supervisor) -> RemoteAccessReport {
        let mut report = RemoteAccessReport::default();
        if !self.config.enabled {
            info!(service = SERVICE, "remote access disabled");
            return report;
        }

        if let Err(e) = std::fs::create_dir_all(self.layout.ssh_dir()) {
            report.issues.push(RuntimeIssue::new(SERVICE, "SSH-HOSTKEY", e.to_string()));
            return report;
        }

        report.generated_keys = self.ensure_host_keys(&mut report.issues).await;

        let mut validation = self.render_and_validate().await;
        if let Err(first) = &validation {
            warn!(service = SERVICE, error = %first, "configuration rejected, repairing host keys");
            report.repaired = true;
            self.repair(&mut report).await;
            validation = self.render_and_validate().await;
        }

        if let Err(e) = validation {
            report.issues.push(
                RuntimeIssue::new(SERVICE, "SSH-CONFIG-INVALID", e)
                    .with_context_entry("config", self.layout.sshd_config().path().display().to_string()),
            );
            for issue in &report.issues {
                warn!(service = SERVICE, "{}", issue.render());
            }
            return report;
        }

        let spec = CommandSpec::new(&self.config.sshd_binary)
            .args(["-D", "-e", "-f"])
            .arg(self.layout.sshd_config().path().display().to_string())
            .log_file(self.layout.ssh_dir().join("sshd.log"));
        match self.runner.spawn(&spec).await {
            Ok(child) => {
                info!(service = SERVICE, port = self.config.port, pid = ?child.id(), "remote access daemon started");
                supervisor.supervise_child(SSHD_TASK, child);
                report.started = true;
            }
            Err(e) => report
                .issues
                .push(RuntimeIssue::new(SERVICE, "SSH-START", e.to_string())),
        }

        for issue in &report.issues {
            warn!(service = SERVICE, "{}", issue.render());
        }
        report
    }

    async fn ensure_host_keys(&self, issues: &mut Vec<RuntimeIssue>) -> Vec<String> {
        let mut generated = Vec::new();
        for key_type in &self.config.key_types {
            let key = self.layout.ssh_host_key(key_type);
            if key.exists() {
                continue;
            }
            match self.generate_key(key_type).await {
                Ok(()) => {
                    info!(service = SERVICE, key_type = %key_type, "host key generated");
                    generated.push(key_type.clone());
                }
                Err(e) => issues.push(
                    RuntimeIssue::new(SERVICE, "SSH-HOSTKEY", e).with_context_entry("key_type", key_type.clone()),
                ),
            }
        }
        generated
    }

    async fn generate_key(&self, key_type: &str) -> Result<(), String> {
        let key = self.layout.ssh_host_key(key_type);
        // A stale public half would make the pair inconsistent.
        self.layout
            .remove_orphan_host_key_pub(key_type)
            .map_err(|e| e.to_string())?;

        let spec = CommandSpec::new(&self.config.keygen_binary).args([
            "-q".to_string(),
            "-t".to_string(),
            key_type.to_string(),
            "-N".to_string(),
            String::new(),
            "-f".to_string(),
            key.path().display().to_string(),
        ]);
        self.runner
            .run_checked(&spec)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn render_and_validate(&self) -> Result<(), String> {
        let config_path = self.layout.sshd_config();
        std::fs::write(config_path.path(), self.render_config()).map_err(|e| e.to_string())?;

        let spec = CommandSpec::new(&self.config.sshd_binary)
            .arg("-t")
            .arg("-f")
            .arg(config_path.path().display().to_string());
        self.runner
            .run_checked(&spec)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn repair(&self, report: &mut RemoteAccessReport) {
        let regenerated = self.ensure_host_keys(&mut report.issues).await;
        report.generated_keys.extend(regenerated);

        for key_type in &self.config.key_types {
            for (path, mode) in [
                (self.layout.ssh_host_key(key_type), 0o600),
                (self.layout.ssh_host_key_pub(key_type), 0o644),
            ] {
                if !path.exists() {
                    continue;
                }
                if let Err(e) = std::fs::set_permissions(path.path(), std::fs::Permissions::from_mode(mode)) {
                    warn!(service = SERVICE, path = %path.path().display(), error = %e, "could not fix key permissions");
                }
            }
        }
    }
}
