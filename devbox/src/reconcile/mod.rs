//! Runtime bring-up of declared services.
//!
//! The network identity service goes through [`NetworkReconciler`]: start
//! the daemon if needed, wait for readiness with a bounded loop, act on the
//! observed state, clear transient state after repeated readiness timeouts,
//! then hand over to a background watcher. The remote-access daemon goes
//! through [`RemoteAccessService`]. Both are fail-soft and report
//! [`RuntimeIssue`](crate::errors::RuntimeIssue)s instead of errors.

mod auth;
mod backend;
mod bringup;
mod credential;
mod readiness;
mod remote_access;
mod state;
mod watcher;

#[cfg(test)]
mod integration_tests;

pub use auth::{AuthAttempt, AuthGate, AuthState};
pub use backend::{parse_status, CliIdentityBackend, IdentityBackend, DAEMON_TASK};
pub use bringup::{wait_for_outcome, BringUpReport, NetworkReconciler, AUTH_TASK, WATCHER_TASK};
pub use credential::{Credential, CredentialOrigin, CredentialSource};
pub use readiness::ReadinessLedger;
pub use remote_access::{RemoteAccessReport, RemoteAccessService, SSHD_TASK};
pub use state::{
    plan, plan_readiness, Action, BackendState, Observation, ReadinessAction, ServiceState,
    StateTransition, TransitionTracker,
};
pub use watcher::{watch, Backoff, WatcherOutcome, WatcherSettings};

use crate::events::{names, EventSink};
use crate::observability::log_transition;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared transition tracker that logs and emits every change.
pub struct TransitionLog {
    tracker: Mutex<TransitionTracker>,
    event_sink: Arc<dyn EventSink>,
}

impl TransitionLog {
    /// Creates a log for `service`.
    #[must_use]
    pub fn new(service: impl Into<String>, event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            tracker: Mutex::new(TransitionTracker::new(service)),
            event_sink,
        }
    }

    /// Records a state; logs and emits it if it changed.
    pub async fn record(&self, state: ServiceState, address: Option<String>) -> Option<StateTransition> {
        let transition = self.tracker.lock().record(state, address)?;
        log_transition(&transition);
        self.event_sink
            .emit(names::SERVICE_TRANSITION, serde_json::to_value(&transition).ok())
            .await;
        Some(transition)
    }

    /// The last recorded state.
    #[must_use]
    pub fn current(&self) -> Option<ServiceState> {
        self.tracker.lock().current()
    }
}

impl std::fmt::Debug for TransitionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionLog")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
