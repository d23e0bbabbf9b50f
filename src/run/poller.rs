//! Repeating status fetcher for one run.
//!
//! Issuance is strictly periodic: the cadence task never waits for a fetch
//! to finish, so completions can arrive out of order and are tagged with
//! `(generation, seq)` for the machine's stale-detection. Cancellation is
//! cooperative; an in-flight fetch is allowed to finish but checks the flag
//! before committing its completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::api::AgentBackend;
use crate::error::ApiError;
use crate::model::StatusSnapshot;

/// One status-fetch completion.
#[derive(Debug)]
pub(crate) struct PollMsg {
    pub generation: u64,
    pub seq: u64,
    pub outcome: Result<StatusSnapshot, ApiError>,
}

/// Handle for one live polling session. At most one session is alive per
/// controller; retiring it marks the session inert before any further fetch
/// completion can be delivered.
pub(crate) struct PollSession {
    cancel: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl PollSession {
    /// Start polling: an immediate first fetch, then one per interval.
    pub fn start<B: AgentBackend>(
        backend: Arc<B>,
        run_id: String,
        generation: u64,
        interval: Duration,
        tx: UnboundedSender<PollMsg>,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_task = cancel.clone();
        let handle = tokio::spawn(async move {
            // First tick completes immediately.
            let mut ticker = tokio::time::interval(interval);
            let mut seq: u64 = 0;
            loop {
                ticker.tick().await;
                if cancel_task.load(Ordering::Relaxed) {
                    break;
                }
                seq += 1;
                let fetch = backend.poll_status(run_id.clone());
                let tx = tx.clone();
                let cancel_fetch = cancel_task.clone();
                tokio::spawn(async move {
                    let outcome = fetch.await;
                    // A retired session must never deliver a completion.
                    if cancel_fetch.load(Ordering::Relaxed) {
                        return;
                    }
                    let _ = tx.send(PollMsg {
                        generation,
                        seq,
                        outcome,
                    });
                });
            }
        });
        Self { cancel, handle }
    }

    /// Retire the session: set the flag (in-flight fetches discard their
    /// results against it) and stop the cadence task.
    pub fn retire(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        // Dropping a JoinHandle does not stop the task; abort the cadence
        // loop so no further fetches are issued.
        self.handle.abort();
    }
}

impl Drop for PollSession {
    fn drop(&mut self) {
        self.retire();
    }
}
