//! Stop signal shared by a run and the node executions under it.

use std::sync::OnceLock;
use tokio::sync::Notify;
use tracing::debug;

/// A one-shot stop signal carrying the reason it was raised.
///
/// Only the first reason is kept. Worker slots poll
/// [`CancellationToken::is_cancelled`] before claiming a task; blocking
/// waits race against [`CancellationToken::cancelled`].
#[derive(Default)]
pub struct CancellationToken {
    reason: OnceLock<String>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal. Returns false if it was already raised.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.reason.set(reason).is_err() {
            return false;
        }
        debug!(reason = self.reason.get().map(String::as_str), "cancellation requested");
        self.notify.notify_waiters();
        true
    }

    /// Returns whether the signal was raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    /// The reason given by the first [`CancellationToken::cancel`] call.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }

    /// Completes once the signal is raised.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CancellationToken").field(&self.reason.get()).finish()
    }
}
