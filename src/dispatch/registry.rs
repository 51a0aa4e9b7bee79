//! Registry of pending requests

use std::collections::HashMap;

use crate::dispatch::request::{GlobalRequestId, Request};

/// All in-flight requests, keyed by their global id.
#[derive(Default)]
pub struct RequestRegistry {
    pending: HashMap<GlobalRequestId, Request>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: Request) {
        let id = request.id();
        if self.pending.insert(id, request).is_some() {
            log::warn!("request {} registered twice; replacing", id);
        }
    }

    pub fn remove(&mut self, id: GlobalRequestId) -> Option<Request> {
        self.pending.remove(&id)
    }

    pub fn get(&self, id: GlobalRequestId) -> Option<&Request> {
        self.pending.get(&id)
    }

    pub fn get_mut(&mut self, id: GlobalRequestId) -> Option<&mut Request> {
        self.pending.get_mut(&id)
    }

    pub fn contains(&self, id: GlobalRequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GlobalRequestId, &Request)> {
        self.pending.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&GlobalRequestId, &mut Request)> {
        self.pending.iter_mut()
    }

    pub fn ids(&self) -> Vec<GlobalRequestId> {
        self.pending.keys().copied().collect()
    }

    /// Ids of requests belonging to a client, optionally narrowed to one
    /// view. Downloads are skipped when asked: they outlive the client that
    /// started them.
    pub fn matching_ids(
        &self,
        client_id: u32,
        view_id: Option<u32>,
        skip_downloads: bool,
    ) -> Vec<GlobalRequestId> {
        self.pending
            .iter()
            .filter(|(id, request)| {
                id.client_id == client_id
                    && view_id.is_none_or(|v| request.view_id() == v)
                    && !(skip_downloads && request.is_download())
            })
            .map(|(id, _)| *id)
            .collect()
    }
}
