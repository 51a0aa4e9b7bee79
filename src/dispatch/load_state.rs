//! Per-view load state coalescing
//!
//! Every tick, the dispatcher samples the transport load state of each
//! pending request and reduces them to one state per view: the most
//! advanced one, since that is what a status bar wants to show. A view is
//! only notified when its coalesced state actually changed since the last
//! tick.

use std::collections::HashMap;

use url::Url;

use crate::transport::LoadState;

/// The sampled state of one request, tagged with its view
#[derive(Debug, Clone)]
pub struct LoadInfo {
    pub client_id: u32,
    pub view_id: u32,
    pub url: Url,
    pub state: LoadState,
}

/// Pick the state a user would rather see. States are ordered by how far
/// along a request is, and further along is more interesting.
pub fn more_interesting(a: LoadState, b: LoadState) -> LoadState {
    a.max(b)
}

#[derive(Debug, Clone)]
struct ViewEntry {
    url: Url,
    state: LoadState,
}

/// Reduces per-request samples to per-view updates across ticks.
#[derive(Debug, Default)]
pub struct LoadStateTracker {
    last_reported: HashMap<(u32, u32), ViewEntry>,
    current: HashMap<(u32, u32), ViewEntry>,
}

impl LoadStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one request sample into the current tick. The URL kept for a
    /// view is the one belonging to the winning state.
    pub fn record(&mut self, info: LoadInfo) {
        let key = (info.client_id, info.view_id);
        match self.current.get_mut(&key) {
            Some(entry) => {
                let winner = more_interesting(entry.state, info.state);
                if winner != entry.state {
                    entry.state = winner;
                    entry.url = info.url;
                }
            }
            None => {
                self.current.insert(
                    key,
                    ViewEntry {
                        url: info.url,
                        state: info.state,
                    },
                );
            }
        }
    }

    /// Close the tick: emit one update per view whose coalesced state
    /// changed, and roll the current samples into the baseline.
    pub fn take_updates(&mut self) -> Vec<LoadInfo> {
        let mut updates = Vec::new();
        for (&(client_id, view_id), entry) in &self.current {
            let changed = match self.last_reported.get(&(client_id, view_id)) {
                Some(previous) => previous.state != entry.state,
                None => true,
            };
            if changed {
                updates.push(LoadInfo {
                    client_id,
                    view_id,
                    url: entry.url.clone(),
                    state: entry.state,
                });
            }
        }
        self.last_reported = std::mem::take(&mut self.current);
        updates
    }
}
