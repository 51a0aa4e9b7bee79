//! Cross-site navigation handoff

use url::Url;

use crate::dispatch::request::GlobalRequestId;
use crate::handler::{Decision, ResourceHandler};
use crate::ipc::{ClientMessage, ClientSender};
use crate::transport::ResponseHead;
use crate::utils::CompletionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionState {
    /// No response seen yet
    Idle,
    /// Told the old page to unload; holding the event until it acks
    WaitingForAck,
    /// Ack received; events flow through
    Resumed,
}

/// Holds a cross-site response until the outgoing page has run its unload
/// handler.
///
/// The first response (or a failure arriving before any response) parks
/// itself and notifies the view; the view acks via `on_close_page_ack`,
/// which replays the parked event through this handler in the `Resumed`
/// state.
pub struct CrossSiteHandler {
    inner: Box<dyn ResourceHandler>,
    client: ClientSender,
    client_id: u32,
    view_id: u32,
    state: TransitionState,
}

impl CrossSiteHandler {
    pub fn new(
        inner: Box<dyn ResourceHandler>,
        client: ClientSender,
        client_id: u32,
        view_id: u32,
    ) -> Self {
        Self {
            inner,
            client,
            client_id,
            view_id,
            state: TransitionState::Idle,
        }
    }

    fn start_transition(&mut self, id: GlobalRequestId) {
        self.state = TransitionState::WaitingForAck;
        log::debug!(
            "holding cross-site response for request {} until view {}:{} acks",
            id,
            self.client_id,
            self.view_id
        );
        self.client.send(ClientMessage::CrossSiteResponseReady {
            client_id: self.client_id,
            view_id: self.view_id,
            id,
        });
    }
}

impl ResourceHandler for CrossSiteHandler {
    fn on_will_start(&mut self, id: GlobalRequestId, url: &Url) -> Decision {
        self.inner.on_will_start(id, url)
    }

    fn on_upload_progress(&mut self, id: GlobalRequestId, position: u64, size: u64) -> Decision {
        self.inner.on_upload_progress(id, position, size)
    }

    fn on_request_redirected(
        &mut self,
        id: GlobalRequestId,
        new_url: &Url,
        response: &ResponseHead,
    ) -> Decision {
        self.inner.on_request_redirected(id, new_url, response)
    }

    fn on_response_started(&mut self, id: GlobalRequestId, response: &ResponseHead) -> Decision {
        match self.state {
            TransitionState::Idle => {
                self.start_transition(id);
                Decision::Defer
            }
            // The replay after the ack.
            TransitionState::WaitingForAck => {
                self.state = TransitionState::Resumed;
                self.inner.on_response_started(id, response)
            }
            TransitionState::Resumed => self.inner.on_response_started(id, response),
        }
    }

    fn on_will_read(&mut self, id: GlobalRequestId) -> Decision {
        self.inner.on_will_read(id)
    }

    fn on_read_completed(&mut self, id: GlobalRequestId, data: &[u8]) -> Decision {
        self.inner.on_read_completed(id, data)
    }

    fn on_response_completed(
        &mut self,
        id: GlobalRequestId,
        status: &CompletionStatus,
    ) -> Decision {
        match self.state {
            // A failure before any response still needs the old page to
            // unload before the view can show an error.
            TransitionState::Idle => {
                self.start_transition(id);
                Decision::Defer
            }
            TransitionState::WaitingForAck => {
                self.state = TransitionState::Resumed;
                self.inner.on_response_completed(id, status)
            }
            TransitionState::Resumed => self.inner.on_response_completed(id, status),
        }
    }

    fn on_response_taken_over(&mut self, id: GlobalRequestId, status: &CompletionStatus) {
        // The view will never render this load, so no unload handoff.
        self.state = TransitionState::Resumed;
        self.inner.on_response_taken_over(id, status);
    }
}
