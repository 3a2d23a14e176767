//! Pure reconciliation state machine.
//!
//! Nothing here touches the filesystem or spawns processes: callers turn
//! observations into [`Action`]s and carry them out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State reported by the identity backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    /// Ambiguous, unavailable or unrecognised.
    Unknown,
    /// The node must authenticate before it can connect.
    NeedsAuth,
    /// Connected.
    Running,
}

impl BackendState {
    /// Maps the backend's own state string.
    #[must_use]
    pub fn from_backend_str(raw: &str) -> Self {
        match raw.trim() {
            "Running" => Self::Running,
            "NeedsLogin" | "NeedsMachineAuth" => Self::NeedsAuth,
            _ => Self::Unknown,
        }
    }
}

/// Lifecycle of a reconciled service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Nothing observed yet, or the backend answer was ambiguous.
    Unknown,
    /// The daemon was started and is not ready yet.
    Starting,
    /// The daemon never became ready; running without it.
    Degraded,
    /// Waiting for authentication.
    NeedsAuth,
    /// Connected.
    Running,
}

impl From<BackendState> for ServiceState {
    fn from(state: BackendState) -> Self {
        match state {
            BackendState::Unknown => Self::Unknown,
            BackendState::NeedsAuth => Self::NeedsAuth,
            BackendState::Running => Self::Running,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Starting => write!(f, "starting"),
            Self::Degraded => write!(f, "degraded"),
            Self::NeedsAuth => write!(f, "needs_auth"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// One look at the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Backend state.
    pub backend: BackendState,
    /// Connectivity address, once assigned.
    pub address: Option<String>,
}

impl Observation {
    /// An observation with no address.
    #[must_use]
    pub fn new(backend: BackendState) -> Self {
        Self {
            backend,
            address: None,
        }
    }

    /// Sets the address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// The service state this observation implies.
    #[must_use]
    pub fn service_state(&self) -> ServiceState {
        self.backend.into()
    }
}

/// Corrective step for an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Leave things alone and look again later.
    Wait,
    /// Authenticate with the available credential.
    Authenticate,
    /// Authentication is needed and no usable credential exists.
    AwaitCredential,
    /// Connected: enable secondary access and stop watching.
    Connected,
}

/// Decides what to do about `observation`.
///
/// `Unknown` never triggers a corrective action.
#[must_use]
pub fn plan(observation: &Observation, credential_available: bool) -> Action {
    match observation.backend {
        BackendState::Unknown => Action::Wait,
        BackendState::NeedsAuth if credential_available => Action::Authenticate,
        BackendState::NeedsAuth => Action::AwaitCredential,
        BackendState::Running => Action::Connected,
    }
}

/// What to do after a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessAction {
    /// The daemon answered.
    Proceed,
    /// Not ready; continue degraded.
    Degraded,
    /// Not ready for the configured number of consecutive starts: clear
    /// transient state, then continue degraded.
    CleanRestart,
}

/// Decides on the readiness outcome.
///
/// `consecutive_timeouts` includes the current timeout. A zero threshold
/// disables cleanup.
#[must_use]
pub fn plan_readiness(ready: bool, consecutive_timeouts: u32, threshold: u32) -> ReadinessAction {
    if ready {
        ReadinessAction::Proceed
    } else if threshold > 0 && consecutive_timeouts >= threshold {
        ReadinessAction::CleanRestart
    } else {
        ReadinessAction::Degraded
    }
}

/// An observed change of service state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// The service.
    pub service: String,
    /// Previous state, `None` for the first observation.
    pub from: Option<ServiceState>,
    /// New state.
    pub to: ServiceState,
    /// Address at the time of the change.
    pub address: Option<String>,
}

/// Remembers the last state so only changes are reported.
#[derive(Debug, Clone, Default)]
pub struct TransitionTracker {
    service: String,
    current: Option<ServiceState>,
    address: Option<String>,
}

impl TransitionTracker {
    /// Creates a tracker for `service`.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            current: None,
            address: None,
        }
    }

    /// The last recorded state.
    #[must_use]
    pub fn current(&self) -> Option<ServiceState> {
        self.current
    }

    /// Records `state`; returns the transition if anything changed.
    pub fn record(&mut self, state: ServiceState, address: Option<String>) -> Option<StateTransition> {
        if self.current == Some(state) && self.address == address {
            return None;
        }
        let transition = StateTransition {
            service: self.service.clone(),
            from: self.current,
            to: state,
            address: address.clone(),
        };
        self.current = Some(state);
        self.address = address;
        Some(transition)
    }
}
