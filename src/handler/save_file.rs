//! Terminal handler for save-page fetches

use url::Url;

use crate::dispatch::request::GlobalRequestId;
use crate::handler::{Decision, ResourceHandler};
use crate::ipc::{ClientMessage, ClientSender};
use crate::transport::ResponseHead;
use crate::utils::CompletionStatus;

/// Streams the body of a cache-only fetch to the save-page machinery.
/// No response head is forwarded and no data acks are expected.
pub struct SaveFileHandler {
    client: ClientSender,
}

impl SaveFileHandler {
    pub fn new(client: ClientSender) -> Self {
        Self { client }
    }
}

impl ResourceHandler for SaveFileHandler {
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

    fn on_response_started(&mut self, _id: GlobalRequestId, _response: &ResponseHead) -> Decision {
        Decision::Continue
    }

    fn on_read_completed(&mut self, id: GlobalRequestId, data: &[u8]) -> Decision {
        self.client.send(ClientMessage::SaveFileData {
            id,
            data: data.to_vec(),
        });
        Decision::Continue
    }

    fn on_response_completed(
        &mut self,
        id: GlobalRequestId,
        status: &CompletionStatus,
    ) -> Decision {
        self.client.send(ClientMessage::SaveFileComplete {
            id,
            status: status.clone(),
        });
        Decision::Continue
    }
}
