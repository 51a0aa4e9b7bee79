//! Deferred starts for views that are not ready to load
//!
//! While a view is mid-transition (for example running its unload handler)
//! any new loads targeting it are not started; their descriptors queue here
//! in arrival order. Resuming the view replays the queue through the normal
//! begin path; cancelling it completes each queued request as aborted.

use std::collections::HashMap;

use crate::dispatch::request::RequestDescriptor;

/// Queues of not-yet-started requests, keyed by (client, view).
#[derive(Default)]
pub struct BlockedRequestMap {
    queues: HashMap<(u32, u32), Vec<RequestDescriptor>>,
}

impl BlockedRequestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start holding new requests for a view. Returns false if the view
    /// was already blocked.
    pub fn block(&mut self, client_id: u32, view_id: u32) -> bool {
        let key = (client_id, view_id);
        if self.queues.contains_key(&key) {
            log::warn!(
                "view {}:{} blocked twice; ignoring",
                client_id,
                view_id
            );
            return false;
        }
        self.queues.insert(key, Vec::new());
        true
    }

    pub fn is_blocked(&self, client_id: u32, view_id: u32) -> bool {
        self.queues.contains_key(&(client_id, view_id))
    }

    /// Queue a request for a blocked view. Callers check `is_blocked`
    /// first; pushing to an unblocked view is a bug.
    pub fn push(&mut self, descriptor: RequestDescriptor) {
        let key = (descriptor.client_id, descriptor.view_id);
        match self.queues.get_mut(&key) {
            Some(queue) => queue.push(descriptor),
            None => log::warn!(
                "dropping request {} queued for unblocked view {}:{}",
                descriptor.id(),
                key.0,
                key.1
            ),
        }
    }

    /// Unblock a view, returning its queue in arrival order. An unknown
    /// view yields an empty queue.
    pub fn take(&mut self, client_id: u32, view_id: u32) -> Vec<RequestDescriptor> {
        self.queues
            .remove(&(client_id, view_id))
            .unwrap_or_default()
    }

    /// Views of one client that currently hold a queue
    pub fn views_for_client(&self, client_id: u32) -> Vec<u32> {
        self.queues
            .keys()
            .filter(|(c, _)| *c == client_id)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn blocked_view_count(&self) -> usize {
        self.queues.len()
    }

    /// Empty every queue, for shutdown
    pub fn drain_all(&mut self) -> Vec<RequestDescriptor> {
        self.queues.drain().flat_map(|(_, queue)| queue).collect()
    }
}
