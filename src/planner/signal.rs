//! Run-level cancellation.
//!
//! The signal is checked before each batch starts. Batches already in
//! flight always run to completion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Cloneable cancellation signal shared by a run and its triggers.
#[derive(Debug, Clone)]
pub struct RunSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for RunSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSignal {
    /// Creates a signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            warn!("Run cancellation requested: {reason}");
            *current = Some(reason);
            true
        });
    }

    /// Returns the cancellation reason, if the signal fired.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Returns true if the signal fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Fires the signal after `timeout`. Abort the handle to disarm.
    #[must_use]
    pub fn arm_timeout(&self, timeout: Duration) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            signal.cancel(format!("run timeout of {}s exceeded", timeout.as_secs()));
        })
    }
}
