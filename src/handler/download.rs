//! Download sink and terminal download handler

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use url::Url;

use crate::dispatch::DispatchHandle;
use crate::dispatch::request::GlobalRequestId;
use crate::handler::{Decision, ResourceHandler};
use crate::ipc::{ClientMessage, ClientSender};
use crate::policy::PluginRegistry;
use crate::transport::ResponseHead;
use crate::utils::CompletionStatus;

/// Queued chunks a download may hold before its reads are paused. The
/// file writer on the Client context drains the queue; once it falls back
/// under the threshold the pause lifts on the next tick.
pub const MAX_QUEUED_DOWNLOAD_CHUNKS: usize = 100;

/// Everything the client side needs to create a download
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadCreateInfo {
    pub download_id: u32,
    pub id: GlobalRequestId,
    pub client_id: u32,
    pub view_id: u32,
    pub url: Url,
    pub mime_type: String,
    pub content_disposition: String,
    /// 0 when the server did not declare a length
    pub content_length: u64,
}

/// Shared chunk queue between the IO-side download handler and the
/// Client-side file writer.
#[derive(Clone, Debug, Default)]
pub struct DownloadBuffer {
    inner: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl DownloadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue one chunk. Returns true when the queue was empty, meaning the
    /// file writer is idle and needs a nudge.
    pub fn push(&self, chunk: Vec<u8>) -> bool {
        let mut queue = self.lock();
        let was_empty = queue.is_empty();
        queue.push_back(chunk);
        was_empty
    }

    /// Take the next chunk for writing
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.lock().pop_front()
    }

    /// Drain everything queued so far
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Whether a response should be saved to disk instead of rendered.
///
/// A non-empty Content-Disposition normally forces a download, except for
/// a few degenerate values broken servers send for inline content. Failing
/// that, anything the embedder can display or hand to a plugin stays a
/// page load.
pub fn should_download(
    mime_type: &str,
    content_disposition: &str,
    plugins: &dyn PluginRegistry,
) -> bool {
    let mime = mime_type.to_ascii_lowercase();
    let disposition = content_disposition.trim().to_ascii_lowercase();

    if !disposition.is_empty() {
        // Broken sites send these for content meant to display inline.
        let inline_only = disposition.starts_with(';')
            || disposition.starts_with("inline")
            || disposition.starts_with("filename")
            || disposition.starts_with("name");
        if !inline_only {
            return true;
        }
    }

    if is_displayable_mime_type(&mime) {
        return false;
    }

    !plugins.have_plugin_for(&mime)
}

fn is_displayable_mime_type(mime: &str) -> bool {
    if mime.starts_with("text/") || mime.starts_with("image/") {
        return true;
    }
    matches!(
        mime,
        "application/xhtml+xml"
            | "application/xml"
            | "application/json"
            | "application/javascript"
            | "application/x-javascript"
    )
}

/// Terminal handler that routes the response body into a [`DownloadBuffer`]
/// instead of the requesting client.
///
/// At response start it announces the download, hands its sink to the
/// dispatcher and votes a pause; the pause lifts when the embedder acks
/// file creation. Chunks never count against the data-message watermark.
pub struct DownloadHandler {
    client: ClientSender,
    dispatch: DispatchHandle,
    download_id: u32,
    client_id: u32,
    view_id: u32,
    url: Url,
    buffer: DownloadBuffer,
    announced: bool,
}

impl DownloadHandler {
    pub fn new(
        client: ClientSender,
        dispatch: DispatchHandle,
        download_id: u32,
        client_id: u32,
        view_id: u32,
        url: Url,
    ) -> Self {
        Self {
            client,
            dispatch,
            download_id,
            client_id,
            view_id,
            url,
            buffer: DownloadBuffer::new(),
            announced: false,
        }
    }

    pub fn download_id(&self) -> u32 {
        self.download_id
    }
}

impl ResourceHandler for DownloadHandler {
    fn on_will_start(&mut self, _id: GlobalRequestId, url: &Url) -> Decision {
        self.url = url.clone();
        Decision::Continue
    }

    fn on_request_redirected(
        &mut self,
        _id: GlobalRequestId,
        new_url: &Url,
        _response: &ResponseHead,
    ) -> Decision {
        self.url = new_url.clone();
        Decision::Continue
    }

    fn on_response_started(&mut self, id: GlobalRequestId, response: &ResponseHead) -> Decision {
        if self.announced {
            return Decision::Continue;
        }
        self.announced = true;

        let info = DownloadCreateInfo {
            download_id: self.download_id,
            id,
            client_id: self.client_id,
            view_id: self.view_id,
            url: self.url.clone(),
            mime_type: response.mime_type.clone(),
            content_disposition: response.content_disposition.clone(),
            content_length: response.content_length.max(0) as u64,
        };
        log::debug!(
            "starting download {} for request {}: {}",
            self.download_id,
            id,
            info.url
        );
        self.client.send(ClientMessage::DownloadStarted { info });

        self.dispatch
            .mark_download(id, self.download_id, self.buffer.clone());
        // Hold reads until the embedder acks that the file exists.
        self.dispatch.pause(id);
        Decision::Continue
    }

    fn on_read_completed(&mut self, _id: GlobalRequestId, data: &[u8]) -> Decision {
        if self.buffer.push(data.to_vec()) {
            self.client.send(ClientMessage::DownloadUpdated {
                download_id: self.download_id,
            });
        }
        Decision::Continue
    }

    fn on_response_completed(
        &mut self,
        _id: GlobalRequestId,
        status: &CompletionStatus,
    ) -> Decision {
        self.client.send(ClientMessage::DownloadCompleted {
            download_id: self.download_id,
            status: status.clone(),
        });
        Decision::Continue
    }
}
