//! Per-file acknowledgement tracking on the sender side.
//!
//! The frame dispatcher calls [`AckTracker::acknowledge`] when an `Ack`
//! frame arrives; the transfer session registers each file before sending
//! its metadata and then waits on it. Registering first means an ack that
//! races ahead of the wait (receiver finalized on byte count) is never lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Ack arrived after the completion frame.
    Acknowledged,
    /// Receiver had already finalized from the byte count; no completion
    /// frame was needed.
    AlreadyAcknowledged,
    /// No ack within the bounded wait. Non-fatal.
    TimedOut,
}

#[derive(Clone, Default)]
pub struct AckTracker {
    slots: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Uuid, watch::Sender<bool>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, file_id: Uuid) {
        self.slots().insert(file_id, watch::channel(false).0);
    }

    /// Record an ack. Returns `false` for files that are not being tracked.
    pub fn acknowledge(&self, file_id: Uuid) -> bool {
        match self.slots().get(&file_id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => {
                debug!(event = "ack_untracked", %file_id, "Ack for untracked file");
                false
            }
        }
    }

    pub fn is_acknowledged(&self, file_id: Uuid) -> bool {
        self.slots()
            .get(&file_id)
            .map(|tx| *tx.borrow())
            .unwrap_or(false)
    }

    /// Wait up to `timeout` for the ack. Returns whether it arrived.
    pub async fn wait(&self, file_id: Uuid, timeout: Duration) -> bool {
        let rx = self.slots().get(&file_id).map(|tx| tx.subscribe());
        let Some(mut rx) = rx else {
            return false;
        };
        tokio::time::timeout(timeout, async move {
            rx.wait_for(|acked| *acked).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }

    pub fn forget(&self, file_id: Uuid) {
        self.slots().remove(&file_id);
    }
}
