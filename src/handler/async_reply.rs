//! Terminal handler for ordinary asynchronous consumers

use url::Url;

use crate::dispatch::DispatchHandle;
use crate::dispatch::request::GlobalRequestId;
use crate::handler::{Decision, ResourceHandler};
use crate::ipc::{ClientMessage, ClientSender};
use crate::transport::ResponseHead;
use crate::utils::CompletionStatus;

/// Streams every event to the client as it happens. Each data chunk is
/// reported to the dispatcher so unacked messages count against the
/// backpressure watermark.
pub struct AsyncReplyHandler {
    client: ClientSender,
    dispatch: DispatchHandle,
}

impl AsyncReplyHandler {
    pub fn new(client: ClientSender, dispatch: DispatchHandle) -> Self {
        Self { client, dispatch }
    }
}

impl ResourceHandler for AsyncReplyHandler {
    fn on_will_start(&mut self, _id: GlobalRequestId, _url: &Url) -> Decision {
        Decision::Continue
    }

    fn on_upload_progress(&mut self, id: GlobalRequestId, position: u64, size: u64) -> Decision {
        self.client.send(ClientMessage::UploadProgress { id, position, size });
        Decision::Continue
    }

    fn on_request_redirected(
        &mut self,
        id: GlobalRequestId,
        new_url: &Url,
        _response: &ResponseHead,
    ) -> Decision {
        self.client.send(ClientMessage::ReceivedRedirect {
            id,
            new_url: new_url.clone(),
        });
        Decision::Continue
    }

    fn on_response_started(&mut self, id: GlobalRequestId, response: &ResponseHead) -> Decision {
        self.client.send(ClientMessage::ReceivedResponse {
            id,
            response: response.clone(),
        });
        Decision::Continue
    }

    fn on_read_completed(&mut self, id: GlobalRequestId, data: &[u8]) -> Decision {
        self.client.send(ClientMessage::DataReceived {
            id,
            data: data.to_vec(),
        });
        self.dispatch.data_sent(id);
        Decision::Continue
    }

    fn on_response_completed(
        &mut self,
        id: GlobalRequestId,
        status: &CompletionStatus,
    ) -> Decision {
        self.client.send(ClientMessage::RequestComplete {
            id,
            status: status.clone(),
        });
        Decision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchHandle;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_streams_events_to_client() {
        let (client, rx) = ClientSender::channel();
        let (dispatch, _commands) = DispatchHandle::channel();
        let mut handler = AsyncReplyHandler::new(client, dispatch);
        let id = GlobalRequestId::new(1, 1);

        assert!(handler.on_will_start(id, &url("http://example.com/")).is_continue());
        handler.on_response_started(id, &ResponseHead::default());
        handler.on_read_completed(id, b"body");
        handler.on_response_completed(id, &Ok(()));

        assert!(matches!(rx.try_recv(), Ok(ClientMessage::ReceivedResponse { .. })));
        match rx.try_recv() {
            Ok(ClientMessage::DataReceived { data, .. }) => assert_eq!(data, b"body"),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(
            rx.try_recv(),
            Ok(ClientMessage::RequestComplete { status: Ok(()), .. })
        ));
    }
}
