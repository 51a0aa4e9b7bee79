//! Response processing chains
//!
//! Each request owns a chain of [`ResourceHandler`] decorators ending in a
//! terminal handler that posts to the client side. Wrappers forward every
//! event to the handler they wrap and may veto or park it; the dispatcher
//! interprets the [`Decision`] each delivery returns. Handlers never call
//! the dispatcher directly; side effects travel back as queued commands
//! through a [`DispatchHandle`](crate::dispatch::DispatchHandle).

pub mod async_reply;
pub mod buffered;
pub mod cross_site;
pub mod download;
pub mod safe_browsing;
pub mod save_file;
pub mod sync_reply;

use url::Url;

use crate::dispatch::request::GlobalRequestId;
use crate::transport::ResponseHead;
use crate::utils::CompletionStatus;

/// What a handler wants done with the event it was just shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Proceed with the request
    Continue,
    /// Park this event; the dispatcher replays it verbatim when the
    /// handler's reason to wait clears
    Defer,
    /// Abort the request
    Cancel,
}

impl Decision {
    pub fn is_continue(&self) -> bool {
        matches!(self, Decision::Continue)
    }
}

/// One stage of a request's processing chain.
///
/// Events arrive in lifecycle order: `on_will_start`, zero or more
/// `on_request_redirected`, `on_response_started`, zero or more
/// `on_read_completed` (never with an empty chunk), then exactly one
/// `on_response_completed`. A `Defer` return parks the current event; on
/// resume the same event is delivered again and the handler must recognize
/// the replay.
pub trait ResourceHandler: Send {
    fn on_will_start(&mut self, id: GlobalRequestId, url: &Url) -> Decision;

    /// Throttled upload progress. Most handlers do not care.
    fn on_upload_progress(&mut self, _id: GlobalRequestId, _position: u64, _size: u64) -> Decision {
        Decision::Continue
    }

    fn on_request_redirected(
        &mut self,
        id: GlobalRequestId,
        new_url: &Url,
        response: &ResponseHead,
    ) -> Decision;

    fn on_response_started(&mut self, id: GlobalRequestId, response: &ResponseHead) -> Decision;

    /// The next body read is about to be issued.
    fn on_will_read(&mut self, _id: GlobalRequestId) -> Decision {
        Decision::Continue
    }

    fn on_read_completed(&mut self, id: GlobalRequestId, data: &[u8]) -> Decision;

    /// Terminal event. A `Cancel` return here is meaningless and is logged
    /// and ignored by the dispatcher; `Defer` parks the completion.
    fn on_response_completed(
        &mut self,
        id: GlobalRequestId,
        status: &CompletionStatus,
    ) -> Decision;

    /// Terminal event for a chain that is being detached: the response now
    /// belongs to a different consumer and no replay will ever arrive, so
    /// this must not be parked. Decorators with hold semantics pass it
    /// straight to the handler they wrap.
    fn on_response_taken_over(&mut self, id: GlobalRequestId, status: &CompletionStatus) {
        self.on_response_completed(id, status);
    }
}
