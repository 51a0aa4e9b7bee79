//! Messages crossing from the IO context to the Client context
//!
//! The dispatcher and its handlers never share live state with the client
//! side; everything UI-visible (response data, prompts, load-state and
//! download progress) is posted as an owned [`ClientMessage`] over a
//! standard mpsc channel. The embedder routes messages by the ids they
//! carry.

use std::sync::mpsc::{Receiver, Sender, channel};

use url::Url;

use crate::dispatch::request::GlobalRequestId;
use crate::handler::download::DownloadCreateInfo;
use crate::transport::{AuthChallenge, LoadState, ResponseHead};
use crate::utils::CompletionStatus;

/// One notification posted to the Client context
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// The transport was redirected before producing a response
    ReceivedRedirect { id: GlobalRequestId, new_url: Url },
    /// Response metadata for an asynchronous consumer
    ReceivedResponse {
        id: GlobalRequestId,
        response: ResponseHead,
    },
    /// One body chunk; must be acked to keep the request flowing
    DataReceived { id: GlobalRequestId, data: Vec<u8> },
    /// Throttled upload progress; must be acked before the next report
    UploadProgress {
        id: GlobalRequestId,
        position: u64,
        size: u64,
    },
    /// Terminal notification for an asynchronous consumer
    RequestComplete {
        id: GlobalRequestId,
        status: CompletionStatus,
    },
    /// Entire reply for a synchronous load, delivered in one message
    SyncLoadResult {
        id: GlobalRequestId,
        status: CompletionStatus,
        response: ResponseHead,
        data: Vec<u8>,
    },
    /// Coalesced per-view load state, at most one per view per tick
    LoadStateChanged {
        client_id: u32,
        view_id: u32,
        url: Url,
        state: LoadState,
    },
    /// The transport hit an auth challenge; answer with `resolve_auth`
    AuthNeeded {
        id: GlobalRequestId,
        challenge: AuthChallenge,
    },
    /// A pending auth prompt is obsolete because its request went away
    AuthPromptCancelled { id: GlobalRequestId },
    /// Certificate error; answer with `resolve_ssl_error`
    SslCertificateError {
        id: GlobalRequestId,
        error: i32,
        cert_id: u32,
    },
    /// A frame load targeted a scheme the transport cannot service
    LaunchExternalProtocol {
        client_id: u32,
        view_id: u32,
        url: Url,
    },
    /// A response is being diverted to a download sink; ack file creation
    /// with `on_download_file_ready`
    DownloadStarted { info: DownloadCreateInfo },
    /// The download buffer went from empty to non-empty; the file writer
    /// should drain it
    DownloadUpdated { download_id: u32 },
    /// The download's transport finished
    DownloadCompleted {
        download_id: u32,
        status: CompletionStatus,
    },
    /// One body chunk of a save-page fetch
    SaveFileData { id: GlobalRequestId, data: Vec<u8> },
    /// A save-page fetch finished
    SaveFileComplete {
        id: GlobalRequestId,
        status: CompletionStatus,
    },
    /// A cross-site response (or failed transition) is ready; the view
    /// should run its unload handler and ack with `on_close_page_ack`
    CrossSiteResponseReady {
        client_id: u32,
        view_id: u32,
        id: GlobalRequestId,
    },
}

/// Sending half of the IO-to-Client channel, cloned into every handler
/// that needs to notify the client side.
#[derive(Clone)]
pub struct ClientSender {
    tx: Sender<ClientMessage>,
}

impl ClientSender {
    /// Create a connected channel pair
    pub fn channel() -> (Self, Receiver<ClientMessage>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }

    /// Post a message to the Client context. A closed receiver is normal
    /// during shutdown and is not an error.
    pub fn send(&self, message: ClientMessage) {
        if self.tx.send(message).is_err() {
            log::debug!("client channel closed; notification dropped");
        }
    }
}
