//! Ack correlation: per-channel table of outstanding ack requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

/// Outcome delivered to a waiting `ack` call.
#[derive(Debug)]
pub(crate) enum AckOutcome {
    /// Raw JSON array carried by the ack response.
    Success(String),
    /// The channel shut down before the response arrived.
    Closed,
}

/// ackIDs are monotonic per channel and never reused within a session.
#[derive(Default)]
pub(crate) struct AckTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<AckOutcome>>>,
}

impl AckTable {
    /// Reserve the next ack id and install its response slot.
    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<AckOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Drop the slot, e.g. after the caller's wait lapsed.
    pub(crate) fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Complete the slot with the raw response args. Unknown ids (already
    /// timed out, or never issued) are dropped.
    pub(crate) fn resolve(&self, id: u64, raw: String) {
        if let Some(tx) = self.lock().remove(&id) {
            let _ = tx.send(AckOutcome::Success(raw));
        }
    }

    /// Fail every outstanding slot; used at channel shutdown.
    pub(crate) fn fail_all(&self) {
        for (_, tx) in self.lock().drain() {
            let _ = tx.send(AckOutcome::Closed);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<AckOutcome>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
