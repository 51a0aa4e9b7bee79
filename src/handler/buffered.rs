//! MIME sniffing and download diversion
//!
//! Sits outermost on page-load chains. When the declared content type is
//! useless it absorbs body bytes until there is enough to sniff, rewrites
//! the response head, and only then lets the head travel down the chain.
//! With the real type in hand it decides whether the response is a page
//! load or a download; downloads swap the rest of the chain out for a
//! [`DownloadHandler`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use url::Url;

use crate::dispatch::DispatchHandle;
use crate::dispatch::request::GlobalRequestId;
use crate::handler::download::{DownloadHandler, should_download};
use crate::handler::{Decision, ResourceHandler};
use crate::ipc::ClientSender;
use crate::policy::PluginRegistry;
use crate::transport::ResponseHead;
use crate::utils::{CompletionStatus, DispatchError};

/// Bytes absorbed before sniffing gives up and uses what it has
pub const SNIFF_BUFFER_SIZE: usize = 1024;

/// Declared types too vague to act on
pub fn should_sniff_mime_type(mime_type: &str) -> bool {
    matches!(
        mime_type,
        "" | "unknown/unknown" | "application/unknown" | "application/octet-stream" | "*/*"
    )
}

/// Guess a content type from leading bytes, falling back to the URL's file
/// extension and finally to a text/binary split.
pub fn sniff_mime_type(data: &[u8], url: &Url) -> String {
    const MAGIC: &[(&[u8], &str)] = &[
        (b"%PDF-", "application/pdf"),
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b\x08", "application/gzip"),
    ];
    for (magic, mime) in MAGIC {
        if data.starts_with(magic) {
            return (*mime).to_string();
        }
    }

    let trimmed: Vec<u8> = data
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .map(|b| b.to_ascii_lowercase())
        .take(16)
        .collect();
    const HTML_TAGS: &[&[u8]] = &[
        b"<!doctype html", b"<html", b"<head", b"<body", b"<script", b"<iframe", b"<table",
    ];
    if HTML_TAGS.iter().any(|tag| trimmed.starts_with(tag)) {
        return "text/html".to_string();
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml".to_string();
    }

    if let Some(mime) = mime_from_extension(url) {
        return mime.to_string();
    }

    let looks_textual = !data.is_empty()
        && data
            .iter()
            .all(|&b| b == b'\t' || b == b'\n' || b == b'\r' || (0x20..0x7f).contains(&b) || b >= 0x80);
    if looks_textual {
        "text/plain".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

fn mime_from_extension(url: &Url) -> Option<&'static str> {
    let path = url.path();
    let extension = path.rsplit_once('.').map(|(_, ext)| ext)?;
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => Some("text/html"),
        "txt" => Some("text/plain"),
        "css" => Some("text/css"),
        "js" => Some("application/javascript"),
        "json" => Some("application/json"),
        "xml" => Some("text/xml"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "pdf" => Some("application/pdf"),
        "zip" => Some("application/zip"),
        _ => None,
    }
}

/// Decorator that withholds the response head until the content type is
/// trustworthy, then routes the response as a page load or a download.
pub struct BufferingHandler {
    inner: Box<dyn ResourceHandler>,
    client: ClientSender,
    dispatch: DispatchHandle,
    plugins: Arc<dyn PluginRegistry>,
    next_download_id: Arc<AtomicU32>,
    client_id: u32,
    view_id: u32,
    allow_download: bool,
    url: Url,
    response: ResponseHead,
    buffer: Vec<u8>,
    /// Absorbing bytes for the sniffer
    sniffing: bool,
    head_sent: bool,
    /// Buffered bytes (if any) have been pushed down the chain
    flushed: bool,
}

impl BufferingHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inner: Box<dyn ResourceHandler>,
        client: ClientSender,
        dispatch: DispatchHandle,
        plugins: Arc<dyn PluginRegistry>,
        next_download_id: Arc<AtomicU32>,
        client_id: u32,
        view_id: u32,
        allow_download: bool,
        url: Url,
    ) -> Self {
        Self {
            inner,
            client,
            dispatch,
            plugins,
            next_download_id,
            client_id,
            view_id,
            allow_download,
            url,
            response: ResponseHead::default(),
            buffer: Vec::new(),
            sniffing: false,
            head_sent: false,
            flushed: false,
        }
    }

    fn finish_sniffing(&mut self) {
        self.sniffing = false;
        let sniffed = sniff_mime_type(&self.buffer, &self.url);
        log::debug!(
            "sniffed '{}' as {} from {} bytes",
            self.response.mime_type,
            sniffed,
            self.buffer.len()
        );
        self.response.mime_type = sniffed;
    }

    /// Route the (now final) head down the chain, or divert to a download.
    /// `head_sent` is only set once the head was accepted.
    fn deliver_head(&mut self, id: GlobalRequestId) -> Decision {
        let head = self.response.clone();
        if self.allow_download
            && should_download(&head.mime_type, &head.content_disposition, &*self.plugins)
        {
            self.divert_to_download(id, &head);
            self.head_sent = true;
            if self.buffer.is_empty() {
                self.flushed = true;
            }
            return Decision::Continue;
        }

        let decision = self.inner.on_response_started(id, &head);
        if decision.is_continue() {
            self.head_sent = true;
            if self.buffer.is_empty() {
                self.flushed = true;
            }
        }
        decision
    }

    fn divert_to_download(&mut self, id: GlobalRequestId, head: &ResponseHead) {
        let download_id = self.next_download_id.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "diverting request {} ({}) to download {}",
            id,
            head.mime_type,
            download_id
        );

        // The original consumer stops waiting; the load it asked for is
        // now a download it will hear about separately. Delivered without
        // holds, since nothing will replay a parked event for this chain.
        self.inner
            .on_response_taken_over(id, &Err(DispatchError::Aborted));

        let mut download = DownloadHandler::new(
            self.client.clone(),
            self.dispatch.clone(),
            download_id,
            self.client_id,
            self.view_id,
            self.url.clone(),
        );
        download.on_response_started(id, head);
        self.inner = Box::new(download);
    }

    /// Push absorbed bytes down the chain once the head is through
    fn flush_buffer(&mut self, id: GlobalRequestId) -> Decision {
        if self.flushed || self.buffer.is_empty() {
            self.flushed = true;
            return Decision::Continue;
        }
        let data = std::mem::take(&mut self.buffer);
        let decision = self.inner.on_read_completed(id, &data);
        if decision == Decision::Defer {
            // Put it back; the replay retries the flush.
            self.buffer = data;
        } else {
            self.flushed = true;
        }
        decision
    }
}

impl ResourceHandler for BufferingHandler {
    fn on_will_start(&mut self, id: GlobalRequestId, url: &Url) -> Decision {
        self.url = url.clone();
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
        self.url = new_url.clone();
        self.inner.on_request_redirected(id, new_url, response)
    }

    fn on_response_started(&mut self, id: GlobalRequestId, response: &ResponseHead) -> Decision {
        self.response = response.clone();
        if should_sniff_mime_type(&response.mime_type) {
            self.sniffing = true;
            // Absorb reads; the head travels once the type is known.
            return Decision::Continue;
        }
        self.deliver_head(id)
    }

    fn on_will_read(&mut self, id: GlobalRequestId) -> Decision {
        self.inner.on_will_read(id)
    }

    fn on_read_completed(&mut self, id: GlobalRequestId, data: &[u8]) -> Decision {
        if self.sniffing {
            self.buffer.extend_from_slice(data);
            if self.buffer.len() < SNIFF_BUFFER_SIZE {
                return Decision::Continue;
            }
            self.finish_sniffing();
        }

        if !self.head_sent {
            let decision = self.deliver_head(id);
            if !decision.is_continue() {
                return decision;
            }
        }

        if !self.flushed {
            // The current chunk is part of the absorbed buffer.
            return self.flush_buffer(id);
        }
        self.inner.on_read_completed(id, data)
    }

    fn on_response_completed(
        &mut self,
        id: GlobalRequestId,
        status: &CompletionStatus,
    ) -> Decision {
        // EOF can land before the sniff buffer fills.
        if self.sniffing {
            self.finish_sniffing();
        }
        if !self.head_sent && status.is_ok() {
            let decision = self.deliver_head(id);
            if !decision.is_continue() {
                return decision;
            }
        }
        if self.head_sent {
            let decision = self.flush_buffer(id);
            if !decision.is_continue() {
                return decision;
            }
        }
        self.inner.on_response_completed(id, status)
    }

    fn on_response_taken_over(&mut self, id: GlobalRequestId, status: &CompletionStatus) {
        self.inner.on_response_taken_over(id, status);
    }
}
