//! Foreground bring-up of the network identity service.

use super::auth::AuthGate;
use super::backend::IdentityBackend;
use super::credential::{Credential, CredentialSource};
use super::readiness::ReadinessLedger;
use super::state::{plan, plan_readiness, Action, Observation, ReadinessAction, ServiceState};
use super::watcher::{watch, WatcherOutcome, WatcherSettings};
use super::TransitionLog;
use crate::cancellation::Supervisor;
use crate::config::NetworkConfig;
use crate::errors::RuntimeIssue;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::layout::PersistentLayout;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Task name of the background watcher.
pub const WATCHER_TASK: &str = "netid-watcher";
/// Task name of the initial authentication attempt.
pub const AUTH_TASK: &str = "netid-auth";

/// Result of the foreground sequence.
#[derive(Debug)]
pub struct BringUpReport {
    /// Service name.
    pub service: String,
    /// State when the foreground sequence returned.
    pub state: ServiceState,
    /// Last observation, if the daemon answered.
    pub observation: Option<Observation>,
    /// Fail-soft problems.
    pub issues: Vec<RuntimeIssue>,
    /// True if transient daemon state was cleared.
    pub cleaned: bool,
    /// Receives the watcher outcome; `None` if no watcher was spawned.
    pub watcher: Option<oneshot::Receiver<WatcherOutcome>>,
}

/// Reconciles the network identity service on every start.
pub struct NetworkReconciler {
    config: NetworkConfig,
    layout: PersistentLayout,
    backend: Arc<dyn IdentityBackend>,
    credentials: CredentialSource,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for NetworkReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkReconciler")
            .field("service", &self.backend.service())
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl NetworkReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        layout: PersistentLayout,
        backend: Arc<dyn IdentityBackend>,
        credentials: CredentialSource,
    ) -> Self {
        Self {
            config,
            layout,
            backend,
            credentials,
            event_sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Readiness ledger of this service.
    #[must_use]
    pub fn ledger(&self) -> ReadinessLedger {
        ReadinessLedger::new(self.layout.readiness_ledger())
    }

    /// Runs the foreground sequence and spawns the watcher under `supervisor`.
    ///
    /// Never fails: problems are returned as issues and the sequence moves
    /// on.
    pub async fn bring_up(&self, supervisor: &Supervisor) -> BringUpReport {
        let service = self.backend.service().to_string();
        let transitions = Arc::new(TransitionLog::new(&service, self.event_sink.clone()));
        let auth = Arc::new(AuthGate::new());
        let mut report = BringUpReport {
            service: service.clone(),
            state: ServiceState::Unknown,
            observation: None,
            issues: Vec::new(),
            cleaned: false,
            watcher: None,
        };

        if !self.config.enabled {
            info!(service = %service, "service disabled, skipping bring-up");
            return report;
        }

        transitions.record(ServiceState::Unknown, None).await;

        // Daemon presence is checked first so a running daemon is left alone.
        if self.backend.daemon_running().await {
            debug!(service = %service, "daemon already running");
        } else {
            transitions.record(ServiceState::Starting, None).await;
            if let Err(e) = self.backend.start_daemon(supervisor).await {
                self.issue(&mut report, RuntimeIssue::new(&service, "NETID-DAEMON-START", e.to_string()))
                    .await;
            }
        }

        // Readiness
        let observation = self.await_ready(supervisor).await;
        let ledger = self.ledger();
        let consecutive = if observation.is_some() {
            if let Err(e) = ledger.reset() {
                warn!(service = %service, error = %e, "could not reset readiness ledger");
            }
            0
        } else {
            ledger.record_timeout().unwrap_or_else(|e| {
                warn!(service = %service, error = %e, "could not record readiness timeout");
                1
            })
        };

        match plan_readiness(
            observation.is_some(),
            consecutive,
            self.config.cleanup_after_timeouts,
        ) {
            ReadinessAction::Proceed => {}
            ReadinessAction::Degraded => {
                transitions.record(ServiceState::Degraded, None).await;
                let issue = RuntimeIssue::new(
                    &service,
                    "NETID-READINESS-TIMEOUT",
                    format!(
                        "daemon not ready after {} attempts",
                        self.config.readiness_attempts
                    ),
                )
                .with_context_entry("consecutive_timeouts", consecutive.to_string());
                self.issue(&mut report, issue).await;
            }
            ReadinessAction::CleanRestart => {
                transitions.record(ServiceState::Degraded, None).await;
                self.clean_transient_state(&mut report, consecutive).await;
            }
        }

        // Authentication never blocks the foreground sequence.
        let credential = self.credentials.load().map(|(credential, origin)| {
            debug!(service = %service, ?origin, "credential available");
            credential
        });

        if let Some(observation) = &observation {
            transitions
                .record(observation.service_state(), observation.address.clone())
                .await;
            match plan(observation, credential.is_some()) {
                Action::Wait => {
                    let issue = RuntimeIssue::new(
                        &service,
                        "NETID-UNKNOWN-STATE",
                        "backend reported an unrecognized state, taking no action",
                    );
                    self.issue(&mut report, issue).await;
                }
                Action::AwaitCredential => {
                    let issue = RuntimeIssue::new(
                        &service,
                        "NETID-NO-CREDENTIAL",
                        "node needs authentication and no valid credential was found",
                    );
                    self.issue(&mut report, issue).await;
                }
                Action::Authenticate => {
                    if let Some(credential) = credential.clone() {
                        self.spawn_authentication(supervisor, &auth, credential);
                    }
                }
                Action::Connected => {}
            }
        }

        report.state = transitions.current().unwrap_or(ServiceState::Unknown);
        report.observation = observation;

        // Watcher
        report.watcher = Some(self.spawn_watcher(supervisor, credential, auth, transitions));
        report
    }

    async fn await_ready(&self, supervisor: &Supervisor) -> Option<Observation> {
        let token = supervisor.cancel_token();
        let attempts = self.config.readiness_attempts.max(1);
        let interval = self.config.readiness_interval();

        for attempt in 1..=attempts {
            match self.backend.observe().await {
                Ok(observation) => {
                    debug!(service = %self.backend.service(), attempt, "daemon ready");
                    return Some(observation);
                }
                Err(e) => {
                    debug!(service = %self.backend.service(), attempt, error = %e, "daemon not ready");
                }
            }
            if attempt < attempts && !token.sleep(interval).await {
                return None;
            }
        }
        None
    }

    async fn clean_transient_state(&self, report: &mut BringUpReport, consecutive: u32) {
        let service = self.backend.service().to_string();
        warn!(service = %service, consecutive, "repeated readiness timeouts, clearing transient daemon state");

        if let Err(e) = self.backend.stop_daemon().await {
            warn!(service = %service, error = %e, "could not stop stalled daemon");
        }

        let mut removed = Vec::new();
        for path in self.layout.netid_transient() {
            match path.remove() {
                Ok(true) => removed.push(path.path().display().to_string()),
                Ok(false) => {}
                Err(e) => warn!(service = %service, path = %path.path().display(), error = %e, "could not remove transient state"),
            }
        }
        info!(service = %service, removed = ?removed, "transient state cleared, identity preserved");
        report.cleaned = true;

        let issue = RuntimeIssue::new(
            &service,
            "NETID-CLEAN-RESTART",
            format!("daemon never became ready on {consecutive} consecutive starts"),
        )
        .with_context_entry("removed", removed.join(", "));
        self.issue(report, issue).await;
    }

    /// Starts the single foreground authentication attempt. The watcher
    /// sees it through `auth` and only retries once it has been rejected.
    fn spawn_authentication(&self, supervisor: &Supervisor, auth: &Arc<AuthGate>, credential: Credential) {
        let Some(attempt) = auth.try_begin() else {
            return;
        };
        let backend = self.backend.clone();
        let sink = self.event_sink.clone();
        supervisor.spawn(AUTH_TASK, move |token| async move {
            let service = backend.service().to_string();
            tokio::select! {
                () = token.cancelled() => {}
                result = backend.authenticate(&credential) => {
                    match result {
                        Ok(()) => {
                            attempt.finish(true);
                            info!(service = %service, "authentication accepted");
                        }
                        Err(e) => {
                            attempt.finish(false);
                            let issue = RuntimeIssue::new(&service, "NETID-AUTH", e.to_string());
                            warn!(service = %service, "{}", issue.render());
                            sink.try_emit(names::SERVICE_ISSUE, serde_json::to_value(&issue).ok());
                        }
                    }
                }
            }
            Ok(())
        });
    }

    fn spawn_watcher(
        &self,
        supervisor: &Supervisor,
        credential: Option<Credential>,
        auth: Arc<AuthGate>,
        transitions: Arc<TransitionLog>,
    ) -> oneshot::Receiver<WatcherOutcome> {
        let (tx, rx) = oneshot::channel();
        let backend = self.backend.clone();
        let sink = self.event_sink.clone();
        let settings = WatcherSettings::from(&self.config.watcher);

        supervisor.spawn(WATCHER_TASK, move |token| async move {
            let outcome = watch(backend, credential, auth, settings, token, transitions, sink).await;
            // The receiver may be gone; the outcome was already logged.
            let _ = tx.send(outcome);
            Ok(())
        });
        rx
    }

    async fn issue(&self, report: &mut BringUpReport, issue: RuntimeIssue) {
        warn!(service = %issue.service, code = %issue.info.code, "{}", issue.render());
        self.event_sink
            .emit(names::SERVICE_ISSUE, serde_json::to_value(&issue).ok())
            .await;
        report.issues.push(issue);
    }
}

/// Waits for the watcher outcome, up to `timeout`.
pub async fn wait_for_outcome(
    rx: oneshot::Receiver<WatcherOutcome>,
    timeout: Duration,
) -> Option<WatcherOutcome> {
    tokio::time::timeout(timeout, rx).await.ok()?.ok()
}
