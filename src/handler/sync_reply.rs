//! Terminal handler for synchronous loads

use url::Url;

use crate::dispatch::request::GlobalRequestId;
use crate::handler::{Decision, ResourceHandler};
use crate::ipc::{ClientMessage, ClientSender};
use crate::transport::ResponseHead;
use crate::utils::CompletionStatus;

/// Buffers the whole reply and posts it as one message at completion. The
/// client blocks on that message, so nothing is sent earlier; data acks are
/// not expected and the backpressure counter is never touched.
pub struct SyncReplyHandler {
    client: ClientSender,
    response: ResponseHead,
    data: Vec<u8>,
}

impl SyncReplyHandler {
    pub fn new(client: ClientSender) -> Self {
        Self {
            client,
            response: ResponseHead::default(),
            data: Vec::new(),
        }
    }
}

impl ResourceHandler for SyncReplyHandler {
    fn on_will_start(&mut self, _id: GlobalRequestId, _url: &Url) -> Decision {
        Decision::Continue
    }

    fn on_request_redirected(
        &mut self,
        _id: GlobalRequestId,
        _new_url: &Url,
        _response: &ResponseHead,
    ) -> Decision {
        Decision::Continue
    }

    fn on_response_started(&mut self, _id: GlobalRequestId, response: &ResponseHead) -> Decision {
        self.response = response.clone();
        Decision::Continue
    }

    fn on_read_completed(&mut self, _id: GlobalRequestId, data: &[u8]) -> Decision {
        self.data.extend_from_slice(data);
        Decision::Continue
    }

    fn on_response_completed(
        &mut self,
        id: GlobalRequestId,
        status: &CompletionStatus,
    ) -> Decision {
        self.client.send(ClientMessage::SyncLoadResult {
            id,
            status: status.clone(),
            response: std::mem::take(&mut self.response),
            data: std::mem::take(&mut self.data),
        });
        Decision::Continue
    }
}
