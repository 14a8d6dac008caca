//! Process-wide registry of running campaign loops.
//!
//! Owned by the scheduler and constructed once at process start; there is
//! no module-level singleton. The registry maps campaign ids to the
//! cancellation handle of their loop, plus the per-campaign rate window and
//! in-flight guard. Windows and guards survive a pause (so the per-minute
//! ceiling still holds across a quick pause/start) and are cleared on stop.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, watch};

use cadence_store::CampaignId;

use crate::rate_window::RateWindow;

/// Cancellation handle for one running loop.
struct LoopHandle {
    shutdown_tx: watch::Sender<bool>,
}

/// Map from campaign id to its running loop and in-memory tick state.
#[derive(Default)]
pub struct CampaignRegistry {
    loops: DashMap<CampaignId, LoopHandle>,
    windows: DashMap<CampaignId, Arc<RateWindow>>,
    guards: DashMap<CampaignId, Arc<Mutex<()>>>,
}

impl CampaignRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a loop currently owns this campaign.
    pub fn is_running(&self, id: CampaignId) -> bool {
        self.loops.contains_key(&id)
    }

    /// Number of running loops.
    pub fn running_count(&self) -> usize {
        self.loops.len()
    }

    /// Atomically claim the campaign for a new loop. Returns the shutdown
    /// receiver for the loop task, or `None` when a loop already exists.
    pub(crate) fn register(&self, id: CampaignId) -> Option<watch::Receiver<bool>> {
        match self.loops.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                entry.insert(LoopHandle { shutdown_tx });
                Some(shutdown_rx)
            }
        }
    }

    /// Cancel the loop so that no further tick fires. An in-flight tick is
    /// allowed to complete. Returns whether a loop was running.
    pub(crate) fn cancel(&self, id: CampaignId) -> bool {
        match self.loops.remove(&id) {
            Some((_, handle)) => {
                // Send fails only if the loop task already exited.
                let _ = handle.shutdown_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Rate window for a campaign, created on first use.
    pub(crate) fn window(&self, id: CampaignId) -> Arc<RateWindow> {
        self.windows
            .entry(id)
            .or_insert_with(|| Arc::new(RateWindow::new()))
            .clone()
    }

    /// In-flight guard for a campaign, created on first use.
    pub(crate) fn guard(&self, id: CampaignId) -> Arc<Mutex<()>> {
        self.guards
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the rate window and in-flight guard. Called on stop, not on
    /// pause.
    pub(crate) fn clear_runtime_state(&self, id: CampaignId) {
        self.windows.remove(&id);
        self.guards.remove(&id);
    }
}
