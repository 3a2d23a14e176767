//! Scripted identity backend.

use crate::cancellation::Supervisor;
use crate::errors::ProcessError;
use crate::layout::PersistentLayout;
use crate::reconcile::{BackendState, Credential, IdentityBackend, Observation};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

type Answer = Result<BackendState, String>;

#[derive(Debug)]
struct Script {
    daemon_running: bool,
    start_fails: bool,
    queued: VecDeque<Answer>,
    sticky: Answer,
    auth_error: Option<String>,
    auth_connects: bool,
    auth_delay: Duration,
    auth_in_flight: usize,
    auth_peak: usize,
    observe_hangs: bool,
    secondary_error: Option<String>,
    calls: Vec<&'static str>,
}

/// An identity backend driven by a script instead of processes.
///
/// With a layout attached it behaves like a real daemon on disk: starting
/// it creates the socket and lock files and, if the state file is missing,
/// a fresh identity. The reported address is derived from the identity,
/// so a lost state file shows up as a changed address.
#[derive(Debug)]
pub struct ScriptedBackend {
    layout: Option<PersistentLayout>,
    script: Mutex<Script>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// A backend whose daemon is down and never answers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            layout: None,
            script: Mutex::new(Script {
                daemon_running: false,
                start_fails: false,
                queued: VecDeque::new(),
                sticky: Err("daemon not answering".to_string()),
                auth_error: None,
                auth_connects: true,
                auth_delay: Duration::ZERO,
                auth_in_flight: 0,
                auth_peak: 0,
                observe_hangs: false,
                secondary_error: None,
                calls: Vec::new(),
            }),
        }
    }

    /// Keeps daemon files under `layout`.
    #[must_use]
    pub fn with_layout(mut self, layout: PersistentLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Reports the daemon as already running.
    #[must_use]
    pub fn with_daemon_running(self) -> Self {
        self.script.lock().daemon_running = true;
        self
    }

    /// Makes starting the daemon fail.
    #[must_use]
    pub fn with_start_failure(self) -> Self {
        self.script.lock().start_fails = true;
        self
    }

    /// Answers every later observation with `state`.
    #[must_use]
    pub fn always(self, state: BackendState) -> Self {
        self.script.lock().sticky = Ok(state);
        self
    }

    /// Never answers.
    #[must_use]
    pub fn never_ready(self) -> Self {
        self.script.lock().sticky = Err("daemon not answering".to_string());
        self
    }

    /// Answers the next observation with `state`.
    #[must_use]
    pub fn then(self, state: BackendState) -> Self {
        self.script.lock().queued.push_back(Ok(state));
        self
    }

    /// Does not answer the next observation.
    #[must_use]
    pub fn then_unready(self) -> Self {
        self.script.lock().queued.push_back(Err("daemon not answering".to_string()));
        self
    }

    /// Makes authentication fail.
    #[must_use]
    pub fn with_auth_failure(self, message: &str) -> Self {
        self.script.lock().auth_error = Some(message.to_string());
        self
    }

    /// Keeps the node in its state after a successful authentication.
    #[must_use]
    pub fn with_auth_not_connecting(self) -> Self {
        self.script.lock().auth_connects = false;
        self
    }

    /// Makes every authentication take `delay` before it answers.
    #[must_use]
    pub fn with_auth_delay(self, delay: Duration) -> Self {
        self.script.lock().auth_delay = delay;
        self
    }

    /// Makes observations hang forever, like a wedged client.
    #[must_use]
    pub fn with_hanging_observe(self) -> Self {
        self.script.lock().observe_hangs = true;
        self
    }

    /// Largest number of authentications that ran at the same time.
    #[must_use]
    pub fn auth_peak(&self) -> usize {
        self.script.lock().auth_peak
    }

    /// Makes the secondary access step fail.
    #[must_use]
    pub fn with_secondary_failure(self, message: &str) -> Self {
        self.script.lock().secondary_error = Some(message.to_string());
        self
    }

    /// Calls made, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<&'static str> {
        self.script.lock().calls.clone()
    }

    /// Number of calls to `method`.
    #[must_use]
    pub fn count(&self, method: &str) -> usize {
        self.script.lock().calls.iter().filter(|c| **c == method).count()
    }

    /// The address the current identity presents.
    #[must_use]
    pub fn identity_address(&self) -> Option<String> {
        let layout = self.layout.as_ref()?;
        let identity = std::fs::read_to_string(layout.netid_state().path()).ok()?;
        let identity = identity.trim();
        if identity.is_empty() {
            return None;
        }
        Some(format!("node-{identity}"))
    }

    fn record(&self, call: &'static str) {
        self.script.lock().calls.push(call);
    }

    fn io_error(e: std::io::Error) -> ProcessError {
        ProcessError::Spawn {
            program: "scripted-daemon".to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl IdentityBackend for ScriptedBackend {
    fn service(&self) -> &str {
        "netid"
    }

    async fn daemon_running(&self) -> bool {
        self.record("daemon_running");
        self.script.lock().daemon_running
    }

    async fn start_daemon(&self, _supervisor: &Supervisor) -> Result<(), ProcessError> {
        self.record("start_daemon");
        if self.script.lock().start_fails {
            return Err(ProcessError::Spawn {
                program: "scripted-daemon".to_string(),
                reason: "no such file or directory".to_string(),
            });
        }
        if let Some(layout) = &self.layout {
            std::fs::create_dir_all(layout.netid_dir()).map_err(Self::io_error)?;
            if !layout.netid_state().exists() {
                std::fs::write(layout.netid_state().path(), uuid::Uuid::new_v4().to_string())
                    .map_err(Self::io_error)?;
            }
            std::fs::write(layout.netid_socket().path(), "").map_err(Self::io_error)?;
            std::fs::write(layout.netid_lock().path(), std::process::id().to_string())
                .map_err(Self::io_error)?;
        }
        self.script.lock().daemon_running = true;
        Ok(())
    }

    async fn observe(&self) -> Result<Observation, ProcessError> {
        self.record("observe");
        if self.script.lock().observe_hangs {
            std::future::pending::<()>().await;
        }
        let answer = {
            let mut script = self.script.lock();
            script.queued.pop_front().unwrap_or_else(|| script.sticky.clone())
        };
        match answer {
            Ok(state) => {
                let mut observation = Observation::new(state);
                if state == BackendState::Running {
                    observation.address = self.identity_address();
                }
                Ok(observation)
            }
            Err(reason) => Err(ProcessError::Exit {
                program: "scripted-client".to_string(),
                code: Some(1),
                stderr: reason,
            }),
        }
    }

    async fn authenticate(&self, _credential: &Credential) -> Result<(), ProcessError> {
        let delay = {
            let mut script = self.script.lock();
            script.calls.push("authenticate");
            script.auth_in_flight += 1;
            script.auth_peak = script.auth_peak.max(script.auth_in_flight);
            script.auth_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock();
        script.auth_in_flight -= 1;
        if let Some(reason) = script.auth_error.clone() {
            return Err(ProcessError::Exit {
                program: "scripted-client".to_string(),
                code: Some(1),
                stderr: reason,
            });
        }
        if script.auth_connects {
            script.queued.clear();
            script.sticky = Ok(BackendState::Running);
        }
        Ok(())
    }

    async fn stop_daemon(&self) -> Result<(), ProcessError> {
        self.record("stop_daemon");
        self.script.lock().daemon_running = false;
        Ok(())
    }

    async fn enable_secondary_access(&self) -> Result<(), ProcessError> {
        self.record("enable_secondary_access");
        match self.script.lock().secondary_error.clone() {
            Some(reason) => Err(ProcessError::Exit {
                program: "scripted-client".to_string(),
                code: Some(1),
                stderr: reason,
            }),
            None => Ok(()),
        }
    }
}
