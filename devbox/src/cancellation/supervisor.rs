//! Supervised background tasks with a shared cancellation token.

use super::CancellationToken;
use crate::process::ChildHandle;
use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct SupervisedTask {
    name: String,
    handle: JoinHandle<Result<(), String>>,
}

/// Outcome of [`Supervisor::shutdown`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that stopped cleanly.
    pub stopped: Vec<String>,
    /// Tasks that returned an error or panicked.
    pub failed: Vec<(String, String)>,
    /// Tasks aborted after the deadline passed.
    pub aborted: Vec<String>,
}

impl ShutdownReport {
    /// Returns true if every task stopped on its own.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_empty()
    }
}

/// Owns the long-running tasks of a session.
///
/// Tasks receive the shared token and are expected to return promptly once
/// it is cancelled. `shutdown` cancels, then joins every task, aborting the
/// ones that miss the deadline.
pub struct Supervisor {
    /// The cancellation token shared by all tasks.
    cancel_token: Arc<CancellationToken>,
    /// Handles to spawned tasks.
    tasks: Mutex<Vec<SupervisedTask>>,
}

impl Supervisor {
    /// Creates a new supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel_token: Arc::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel_token
    }

    /// Spawns a named task.
    pub fn spawn<F, Fut>(&self, name: &str, task: F)
    where
        F: FnOnce(Arc<CancellationToken>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let token = self.cancel_token.clone();
        let handle = tokio::spawn(async move { task(token).await });
        debug!(task = %name, "supervised task spawned");

        self.tasks.lock().push(SupervisedTask {
            name: name.to_string(),
            handle,
        });
    }

    /// Owns a running child process as a named task.
    ///
    /// The child is killed when the token is cancelled. An exit before
    /// cancellation with a non-zero status is reported as a task failure.
    pub fn supervise_child(&self, name: &str, mut child: Box<dyn ChildHandle>) {
        let task_name = name.to_string();
        self.spawn(name, move |token| async move {
            tokio::select! {
                () = token.cancelled() => {}
                status = child.wait() => {
                    return match status {
                        Ok(Some(0)) => Ok(()),
                        Ok(code) => Err(format!("{task_name} exited with status {code:?}")),
                        Err(e) => Err(e.to_string()),
                    };
                }
            }
            debug!(task = %task_name, pid = ?child.id(), "stopping child process");
            child.kill().await.map_err(|e| e.to_string())
        });
    }

    /// Returns the names of tasks that have not been joined yet.
    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.lock().iter().map(|t| t.name.clone()).collect()
    }

    /// Returns the number of tasks not joined yet.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if the named task exists and has finished.
    #[must_use]
    pub fn is_finished(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .iter()
            .any(|t| t.name == name && t.handle.is_finished())
    }

    /// Cancels every task and joins them, aborting stragglers after `timeout`.
    ///
    /// Tasks are joined concurrently against one deadline; the report keeps
    /// spawn order.
    pub async fn shutdown(&self, reason: &str, timeout: Duration) -> ShutdownReport {
        self.cancel_token.cancel(reason);

        let tasks: Vec<SupervisedTask> = std::mem::take(&mut *self.tasks.lock());
        let joins = tasks.into_iter().map(|SupervisedTask { name, mut handle }| async move {
            let joined = tokio::time::timeout(timeout, &mut handle).await;
            if joined.is_err() {
                handle.abort();
            }
            (name, joined)
        });

        let mut report = ShutdownReport::default();
        for (name, joined) in join_all(joins).await {
            match joined {
                Ok(Ok(Ok(()))) => report.stopped.push(name),
                Ok(Ok(Err(e))) => {
                    warn!(task = %name, error = %e, "supervised task failed");
                    report.failed.push((name, e));
                }
                Ok(Err(join_error)) => {
                    warn!(task = %name, error = %join_error, "supervised task panicked");
                    report.failed.push((name, join_error.to_string()));
                }
                Err(_) => {
                    warn!(task = %name, ?timeout, "supervised task ignored cancellation, aborted");
                    report.aborted.push(name);
                }
            }
        }

        report
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("tasks", &self.task_names())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}
