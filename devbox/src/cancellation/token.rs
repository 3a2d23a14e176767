//! Cooperative cancellation shared by the pipeline and background tasks.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// A cancellation flag with a reason.
///
/// The first reason sticks. Stages check [`is_cancelled`](Self::is_cancelled)
/// between steps; long-running tasks await [`cancelled`](Self::cancelled) or
/// use [`sleep`](Self::sleep) for their poll delays.
#[derive(Default)]
pub struct CancellationToken {
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token. Later calls are ignored.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return;
            }
            let reason = reason.into();
            debug!(%reason, "cancellation requested");
            *slot = Some(reason);
        }
        self.notify.notify_waiters();
    }

    /// True once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.lock().is_some()
    }

    /// The reason given to the first [`cancel`](Self::cancel).
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration`. Returns `false` if cancelled first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.cancelled() => false,
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_reason_sticks() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());

        token.cancel("SIGTERM");
        token.cancel("teardown");

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn test_cancel_wakes_every_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop");

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should wake")
                .expect("waiter should not panic");
        }
    }

    #[tokio::test]
    async fn test_sleep_reports_cancellation() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(1)).await);

        token.cancel("already");
        assert!(!token.sleep(Duration::from_secs(30)).await);
    }
}
