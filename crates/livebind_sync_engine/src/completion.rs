//! Completion tracking.
//!
//! The session is initialized the first moment the remote has reported
//! connectivity and every resolved binding has delivered its initial value.
//! The signal fires once and never reverts.

use std::sync::atomic::{AtomicBool, Ordering};

use livebind_core::SyncState;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{BindError, BindResult};

/// One-shot "fully loaded" signal of a session.
#[derive(Debug, Clone)]
pub struct Initialized {
    rx: watch::Receiver<bool>,
}

impl Initialized {
    /// Returns true once the session is initialized.
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the session is initialized.
    ///
    /// Fails with [`BindError::SessionClosed`] if the session is torn down
    /// first.
    pub async fn wait(&mut self) -> BindResult<()> {
        self.rx
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| BindError::SessionClosed)
    }
}

/// Fires [`Initialized`] when both completion facts hold.
#[derive(Debug)]
pub struct CompletionTracker {
    tx: watch::Sender<bool>,
    fired: AtomicBool,
}

impl CompletionTracker {
    /// Creates a tracker and its signal.
    pub fn new() -> (Self, Initialized) {
        let (tx, rx) = watch::channel(false);
        let tracker = Self {
            tx,
            fired: AtomicBool::new(false),
        };
        (tracker, Initialized { rx })
    }

    /// Checks `state` and fires if it is complete. Returns true only on the
    /// call that fired.
    pub fn observe(&self, state: &SyncState) -> bool {
        if !(state.connected && state.initial_fetch_done) {
            return false;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("sync session initialized");
        self.tx.send_replace(true);
        true
    }

    /// Returns true once the signal fired.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
