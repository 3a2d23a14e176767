//! Serializes authentication attempts between bring-up and the watcher.

use parking_lot::Mutex;
use std::sync::Arc;

/// Where authentication stands for this bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// No attempt made yet.
    #[default]
    Idle,
    /// An attempt is running.
    InFlight,
    /// The backend accepted the credential.
    Accepted,
    /// The last attempt failed or was interrupted.
    Rejected,
}

/// Shared between the initial attempt and the watcher.
///
/// At most one attempt runs at a time. A new attempt may only start when
/// nothing was tried yet or the previous attempt was rejected, so an
/// accepted credential is never presented again.
#[derive(Debug, Default)]
pub struct AuthGate {
    state: Mutex<AuthState>,
}

impl AuthGate {
    /// Creates an idle gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        *self.state.lock()
    }

    /// Claims the next attempt, or `None` if one is running or already
    /// succeeded.
    pub fn try_begin(self: &Arc<Self>) -> Option<AuthAttempt> {
        let mut state = self.state.lock();
        match *state {
            AuthState::Idle | AuthState::Rejected => {
                *state = AuthState::InFlight;
                Some(AuthAttempt {
                    gate: Arc::clone(self),
                    finished: false,
                })
            }
            AuthState::InFlight | AuthState::Accepted => None,
        }
    }
}

/// A claimed attempt. Dropping it unfinished counts as a rejection.
#[derive(Debug)]
pub struct AuthAttempt {
    gate: Arc<AuthGate>,
    finished: bool,
}

impl AuthAttempt {
    /// Records the backend's answer.
    pub fn finish(mut self, accepted: bool) {
        *self.gate.state.lock() = if accepted {
            AuthState::Accepted
        } else {
            AuthState::Rejected
        };
        self.finished = true;
    }
}

impl Drop for AuthAttempt {
    fn drop(&mut self) {
        if !self.finished {
            *self.gate.state.lock() = AuthState::Rejected;
        }
    }
}
