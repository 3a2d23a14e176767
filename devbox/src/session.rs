//! Container bring-up and teardown.
//!
//! [`bring_up`] runs on every container start: repair ownership on the
//! volume, load the environment descriptor, reconcile the network identity
//! service, then the remote-access daemon. Every step is fail-soft; only an
//! unusable configuration is an error. The returned [`Session`] owns the
//! background tasks until [`Session::teardown`].

use crate::cancellation::{ShutdownReport, Supervisor};
use crate::config::DevboxConfig;
use crate::environment::{DescriptorFile, EnvironmentDescriptor, ResolvedEnv};
use crate::errors::{Result, RuntimeIssue};
use crate::events::EventSink;
use crate::layout::PersistentLayout;
use crate::permissions::{reconcile_ownership, OwnershipReport};
use crate::process::CommandRunner;
use crate::reconcile::{
    wait_for_outcome, BringUpReport, CliIdentityBackend, CredentialSource, NetworkReconciler,
    RemoteAccessReport, RemoteAccessService, WatcherOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A brought-up container session.
#[derive(Debug)]
pub struct Session {
    supervisor: Supervisor,
    environment: EnvironmentDescriptor,
    ownership: Option<OwnershipReport>,
    network: BringUpReport,
    remote_access: RemoteAccessReport,
    issues: Vec<RuntimeIssue>,
}

impl Session {
    /// The environment descriptor loaded at bring-up.
    #[must_use]
    pub fn environment(&self) -> &EnvironmentDescriptor {
        &self.environment
    }

    /// The descriptor resolved against the process environment.
    #[must_use]
    pub fn resolved_env(&self) -> ResolvedEnv {
        self.environment.resolve_with_process_env()
    }

    /// Ownership repair outcome, if it ran.
    #[must_use]
    pub fn ownership(&self) -> Option<&OwnershipReport> {
        self.ownership.as_ref()
    }

    /// Network identity bring-up outcome.
    #[must_use]
    pub fn network(&self) -> &BringUpReport {
        &self.network
    }

    /// Remote-access bring-up outcome.
    #[must_use]
    pub fn remote_access(&self) -> &RemoteAccessReport {
        &self.remote_access
    }

    /// Every fail-soft problem seen during bring-up, in order.
    #[must_use]
    pub fn issues(&self) -> &[RuntimeIssue] {
        &self.issues
    }

    /// The supervisor owning the background tasks.
    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Waits up to `timeout` for the network watcher to finish.
    ///
    /// Returns `None` if there is no watcher, it was already awaited, or it
    /// is still running when the timeout passes.
    pub async fn wait_watcher(&mut self, timeout: Duration) -> Option<WatcherOutcome> {
        let rx = self.network.watcher.take()?;
        wait_for_outcome(rx, timeout).await
    }

    /// Cancels every background task and waits for them to stop.
    pub async fn teardown(self, timeout: Duration) -> ShutdownReport {
        let report = self.supervisor.shutdown("session teardown", timeout).await;
        if report.is_clean() {
            info!(stopped = report.stopped.len(), "session stopped");
        } else {
            warn!(
                failed = ?report.failed,
                aborted = ?report.aborted,
                "session stopped with errors"
            );
        }
        report
    }
}

/// Brings the container up from `config`.
///
/// # Errors
///
/// Only a configuration that cannot be used (for example an invalid
/// credential pattern) is an error. Runtime problems end up in
/// [`Session::issues`].
pub async fn bring_up(
    config: &DevboxConfig,
    runner: Arc<dyn CommandRunner>,
    event_sink: Arc<dyn EventSink>,
) -> Result<Session> {
    let layout = PersistentLayout::new(&config.volume_root);
    let credentials = CredentialSource::from_config(&config.network, &layout)?;
    let supervisor = Supervisor::new();
    let mut issues = Vec::new();

    info!(volume = %layout.root().display(), "bringing session up");
    if let Err(e) = layout.ensure_dirs() {
        warn!(volume = %layout.root().display(), error = %e, "could not create volume directories");
    }

    let ownership = if config.ownership.enabled {
        let report = repair_ownership(&layout, config.ownership.uid, config.ownership.gid).await;
        if !report.is_clean() {
            let issue = RuntimeIssue::new(
                "volume",
                "PERMISSIONS",
                format!("{} paths could not be repaired", report.failures.len()),
            )
            .with_context_entry("first", first_failure(&report));
            warn!("{}", issue.render());
            issues.push(issue);
        }
        Some(report)
    } else {
        None
    };

    let environment = match DescriptorFile::new(layout.descriptor_file().path()).load().await {
        Ok(descriptor) => {
            info!(fragments = descriptor.len(), "environment descriptor loaded");
            descriptor
        }
        Err(e) => {
            warn!(error = %e, "environment descriptor unreadable, continuing without it");
            EnvironmentDescriptor::new()
        }
    };

    let backend = Arc::new(CliIdentityBackend::new(
        config.network.clone(),
        layout.clone(),
        runner.clone(),
    ));
    let network = NetworkReconciler::new(config.network.clone(), layout.clone(), backend, credentials)
        .with_event_sink(event_sink)
        .bring_up(&supervisor)
        .await;
    issues.extend(network.issues.iter().cloned());

    let remote_access = RemoteAccessService::new(config.remote_access.clone(), layout, runner)
        .bring_up(&supervisor)
        .await;
    issues.extend(remote_access.issues.iter().cloned());

    info!(
        tasks = ?supervisor.task_names(),
        issues = issues.len(),
        "session up"
    );

    Ok(Session {
        supervisor,
        environment,
        ownership,
        network,
        remote_access,
        issues,
    })
}

async fn repair_ownership(layout: &PersistentLayout, uid: u32, gid: u32) -> OwnershipReport {
    let root = layout.root().to_path_buf();
    match tokio::task::spawn_blocking(move || reconcile_ownership(&root, uid, gid)).await {
        Ok(report) => report,
        Err(e) => {
            let mut report = OwnershipReport::default();
            report.failures.push((layout.root().to_path_buf(), e.to_string()));
            report
        }
    }
}

fn first_failure(report: &OwnershipReport) -> String {
    report
        .failures
        .first()
        .map(|(path, reason)| format!("{}: {reason}", path.display()))
        .unwrap_or_default()
}
