//! The dispatch core: one synchronous state machine on the IO context
//!
//! [`ResourceDispatcher`] owns every pending request. Clients and the
//! transport layer call into it; it walks each event through the request's
//! handler chain and reacts to the tri-state decision that comes back.
//! Handlers never call back into the dispatcher directly; their side
//! effects are queued as [`ControlMessage`]s through a [`DispatchHandle`]
//! and drained after every delivery, so the dispatcher is never re-entered
//! while a request is borrowed.

pub mod blocked;
pub mod flow;
pub mod load_state;
pub mod registry;
pub mod request;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use url::Url;

use crate::handler::async_reply::AsyncReplyHandler;
use crate::handler::buffered::BufferingHandler;
use crate::handler::cross_site::CrossSiteHandler;
use crate::handler::download::{DownloadBuffer, DownloadHandler, MAX_QUEUED_DOWNLOAD_CHUNKS};
use crate::handler::safe_browsing::SafeBrowsingHandler;
use crate::handler::save_file::SaveFileHandler;
use crate::handler::sync_reply::SyncReplyHandler;
use crate::handler::{Decision, ResourceHandler};
use crate::ipc::{ClientMessage, ClientSender};
use crate::policy::{
    CertStore, InMemoryCertStore, NoPlugins, NoSafeBrowsing, OpenSecurityPolicy, PluginRegistry,
    SafeBrowsingChecker, SecurityPolicy, UrlCheckVerdict,
};
use crate::transport::{AuthChallenge, AuthCredentials, ReadOutcome, TransportFactory, UploadElement};
use crate::utils::{CompletionStatus, DispatchError, Result};

use blocked::BlockedRequestMap;
use flow::PauseAdjust;
use load_state::{LoadInfo, LoadStateTracker};
use registry::RequestRegistry;
use request::{DeferredEvent, GlobalRequestId, Request, RequestDescriptor, ResourceKind};

/// Cadence of the periodic maintenance pass
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes asked of the transport per read
pub const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Upload progress is re-reported after this much silence
const UPLOAD_PROGRESS_MAX_AGE: Duration = Duration::from_secs(1);

/// Upload progress is reported in increments of size / this
const UPLOAD_PROGRESS_INCREMENTS: u64 = 200;

/// Command a handler queues for the dispatcher to apply once the current
/// delivery unwinds.
#[derive(Debug)]
pub enum ControlMessage {
    /// Add one pause vote
    Pause(GlobalRequestId),
    /// Resume after a forced pause
    Resume(GlobalRequestId),
    Cancel(GlobalRequestId),
    /// One data message went to the client; counts against the watermark
    DataSent(GlobalRequestId),
    /// The response is now a download; attach its sink
    MarkDownload {
        id: GlobalRequestId,
        download_id: u32,
        sink: DownloadBuffer,
    },
}

/// Handler-side sender for [`ControlMessage`]s
#[derive(Clone)]
pub struct DispatchHandle {
    tx: Sender<ControlMessage>,
}

impl DispatchHandle {
    /// Create a detached handle pair; the dispatcher builds its own
    /// internally, this is for wiring handlers up in tests.
    pub fn channel() -> (Self, Receiver<ControlMessage>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }

    fn post(&self, message: ControlMessage) {
        if self.tx.send(message).is_err() {
            log::debug!("dispatcher gone; control message dropped");
        }
    }

    pub fn pause(&self, id: GlobalRequestId) {
        self.post(ControlMessage::Pause(id));
    }

    pub fn resume(&self, id: GlobalRequestId) {
        self.post(ControlMessage::Resume(id));
    }

    pub fn cancel(&self, id: GlobalRequestId) {
        self.post(ControlMessage::Cancel(id));
    }

    pub(crate) fn data_sent(&self, id: GlobalRequestId) {
        self.post(ControlMessage::DataSent(id));
    }

    pub(crate) fn mark_download(&self, id: GlobalRequestId, download_id: u32, sink: DownloadBuffer) {
        self.post(ControlMessage::MarkDownload {
            id,
            download_id,
            sink,
        });
    }
}

/// Hooks for embedder components that watch request lifecycles
pub trait DispatcherObserver: Send {
    fn on_request_started(&mut self, _id: GlobalRequestId, _url: &Url) {}

    fn on_request_redirected(&mut self, _id: GlobalRequestId, _new_url: &Url) {}

    fn on_request_completed(&mut self, _id: GlobalRequestId, _status: &CompletionStatus) {}
}

/// The IO-context request dispatcher.
///
/// All methods are synchronous and expect to be called from one context;
/// cross-context work arrives as plain method calls made by the embedder's
/// message pump and leaves as [`ClientMessage`]s.
pub struct ResourceDispatcher {
    registry: RequestRegistry,
    blocked: BlockedRequestMap,
    load_states: LoadStateTracker,
    client: ClientSender,
    control_tx: Sender<ControlMessage>,
    control_rx: Receiver<ControlMessage>,
    policy: Box<dyn SecurityPolicy>,
    checker: Arc<dyn SafeBrowsingChecker>,
    plugins: Arc<dyn PluginRegistry>,
    cert_store: Arc<dyn CertStore>,
    factory: Box<dyn TransportFactory>,
    observers: Vec<Box<dyn DispatcherObserver>>,
    /// Views whose next main-frame response must wait for an unload ack
    cross_site_pending: HashSet<(u32, u32)>,
    /// Dispatcher-initiated fetches count down from -1
    next_internal_request_id: i32,
    next_download_id: Arc<AtomicU32>,
    is_shutdown: bool,
}

impl ResourceDispatcher {
    pub fn new(client: ClientSender, factory: Box<dyn TransportFactory>) -> Self {
        let (control_tx, control_rx) = channel();
        Self {
            registry: RequestRegistry::new(),
            blocked: BlockedRequestMap::new(),
            load_states: LoadStateTracker::new(),
            client,
            control_tx,
            control_rx,
            policy: Box::new(OpenSecurityPolicy),
            checker: Arc::new(NoSafeBrowsing),
            plugins: Arc::new(NoPlugins),
            cert_store: Arc::new(InMemoryCertStore::new()),
            factory,
            observers: Vec::new(),
            cross_site_pending: HashSet::new(),
            next_internal_request_id: -1,
            next_download_id: Arc::new(AtomicU32::new(1)),
            is_shutdown: false,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn SecurityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_safe_browsing(mut self, checker: Arc<dyn SafeBrowsingChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_plugins(mut self, plugins: Arc<dyn PluginRegistry>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_cert_store(mut self, cert_store: Arc<dyn CertStore>) -> Self {
        self.cert_store = cert_store;
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn DispatcherObserver>) {
        self.observers.push(observer);
    }

    /// Handle for queueing control messages from outside a delivery
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn pending_request_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    // ---- client operations -------------------------------------------

    /// Validate and start a client request, or queue it if its view is
    /// blocked. Returns the id the request will report under.
    pub fn begin(&mut self, descriptor: RequestDescriptor) -> Result<GlobalRequestId> {
        let id = descriptor.id();
        if self.is_shutdown {
            log::warn!("rejecting request {} after shutdown", id);
            self.send_failure(&descriptor, DispatchError::Aborted);
            return Err(DispatchError::Aborted);
        }
        if self.registry.contains(id) {
            log::warn!("duplicate request id {}", id);
            return Err(DispatchError::MalformedRequest(format!(
                "duplicate request id {id}"
            )));
        }
        if !self
            .policy
            .can_request_url(descriptor.client_id, &descriptor.url)
        {
            log::warn!(
                "client {} denied for {}",
                descriptor.client_id,
                descriptor.url
            );
            self.send_failure(&descriptor, DispatchError::PolicyDenied);
            return Err(DispatchError::PolicyDenied);
        }
        for element in &descriptor.upload {
            if let UploadElement::File(path) = element {
                if !self.policy.can_upload_file(descriptor.client_id, path) {
                    log::warn!(
                        "client {} denied upload of {}",
                        descriptor.client_id,
                        path.display()
                    );
                    self.send_failure(&descriptor, DispatchError::PolicyDenied);
                    return Err(DispatchError::PolicyDenied);
                }
            }
        }
        if !self.factory.handles_scheme(descriptor.url.scheme()) {
            if descriptor.kind.is_frame() {
                // Hand the URL to the OS; the page load itself is over.
                self.client.send(ClientMessage::LaunchExternalProtocol {
                    client_id: descriptor.client_id,
                    view_id: descriptor.view_id,
                    url: descriptor.url.clone(),
                });
                self.send_failure(&descriptor, DispatchError::Aborted);
                return Ok(id);
            }
            self.send_failure(
                &descriptor,
                DispatchError::MalformedRequest(format!(
                    "unhandled scheme {}",
                    descriptor.url.scheme()
                )),
            );
            return Err(DispatchError::MalformedRequest(format!(
                "unhandled scheme {}",
                descriptor.url.scheme()
            )));
        }
        if self
            .blocked
            .is_blocked(descriptor.client_id, descriptor.view_id)
        {
            log::debug!("queueing request {} for blocked view", id);
            self.blocked.push(descriptor);
            return Ok(id);
        }

        self.start_request(descriptor);
        Ok(id)
    }

    /// Start a dispatcher-initiated fetch that goes straight to a download
    /// sink.
    pub fn begin_download(
        &mut self,
        client_id: u32,
        view_id: u32,
        url: Url,
    ) -> Result<GlobalRequestId> {
        if self.is_shutdown {
            return Err(DispatchError::Aborted);
        }
        if !self.policy.can_request_url(client_id, &url) {
            return Err(DispatchError::PolicyDenied);
        }
        if !self.factory.handles_scheme(url.scheme()) {
            return Err(DispatchError::MalformedRequest(format!(
                "unhandled scheme {}",
                url.scheme()
            )));
        }

        let request_id = self.next_internal_request_id;
        self.next_internal_request_id -= 1;
        let id = GlobalRequestId::new(client_id, request_id);
        let download_id = self.next_download_id.fetch_add(1, Ordering::Relaxed);

        let mut chain: Box<dyn ResourceHandler> = Box::new(DownloadHandler::new(
            self.client.clone(),
            self.handle(),
            download_id,
            client_id,
            view_id,
            url.clone(),
        ));
        let mut url_check = None;
        if self.checker.enabled() && self.checker.can_check_url(&url) {
            let gate = SafeBrowsingHandler::new(chain, Arc::clone(&self.checker));
            url_check = Some(gate.check_handle());
            chain = Box::new(gate);
        }

        let descriptor = RequestDescriptor::new(client_id, view_id, request_id, url.clone())
            .with_kind(ResourceKind::MainFrame);
        let transport = self.factory.create(descriptor.transport_request());
        let mut request = Request::new(
            id,
            view_id,
            url.clone(),
            ResourceKind::MainFrame,
            descriptor.load_flags,
            false,
            0,
            transport,
            chain,
        );
        // Browser-owned from the first byte: client cancels and teardown
        // must not reach this fetch even before the response arrives.
        request.is_download = true;
        request.download_id = Some(download_id);
        request.url_check = url_check;
        self.registry.insert(request);
        for observer in &mut self.observers {
            observer.on_request_started(id, &url);
        }
        log::debug!("beginning download fetch {} for {}", id, url);
        self.start_transport(id);
        self.drain_control();
        Ok(id)
    }

    /// Start a cache-only fetch feeding the save-page machinery.
    pub fn begin_save_file(
        &mut self,
        client_id: u32,
        view_id: u32,
        url: Url,
    ) -> Result<GlobalRequestId> {
        if self.is_shutdown {
            return Err(DispatchError::Aborted);
        }
        if !self.policy.can_request_url(client_id, &url) {
            return Err(DispatchError::PolicyDenied);
        }
        if !self.factory.handles_scheme(url.scheme()) {
            return Err(DispatchError::MalformedRequest(format!(
                "unhandled scheme {}",
                url.scheme()
            )));
        }

        let request_id = self.next_internal_request_id;
        self.next_internal_request_id -= 1;
        let id = GlobalRequestId::new(client_id, request_id);
        let chain: Box<dyn ResourceHandler> = Box::new(SaveFileHandler::new(self.client.clone()));

        let mut descriptor = RequestDescriptor::new(client_id, view_id, request_id, url.clone());
        descriptor.load_flags.cache_only = true;
        let transport = self.factory.create(descriptor.transport_request());
        let request = Request::new(
            id,
            view_id,
            url.clone(),
            ResourceKind::SubResource,
            descriptor.load_flags,
            false,
            0,
            transport,
            chain,
        );
        self.registry.insert(request);
        for observer in &mut self.observers {
            observer.on_request_started(id, &url);
        }
        log::debug!("beginning save-file fetch {} for {}", id, url);
        self.start_transport(id);
        self.drain_control();
        Ok(id)
    }

    /// Cancel one request. `from_client` marks cancels issued by the
    /// requesting client, which must not take down a diverted download.
    pub fn cancel(&mut self, id: GlobalRequestId, from_client: bool) {
        let had_auth = {
            let Some(request) = self.registry.get_mut(id) else {
                log::warn!("cancel for unknown request {}", id);
                return;
            };
            if from_client && request.is_download {
                log::debug!("ignoring client cancel of download request {}", id);
                return;
            }
            let had_auth = request.auth_challenge.take().is_some();
            if had_auth {
                self.client.send(ClientMessage::AuthPromptCancelled { id });
            }
            had_auth
        };
        if had_auth {
            // A load abandoned at the credentials prompt failed for want of
            // credentials, not because the transport gave up.
            if let Some(request) = self.registry.get_mut(id) {
                request.deferred = None;
                request.transport.cancel();
            }
            self.finish_completion(id, Err(DispatchError::AuthRequired));
        } else {
            self.start_cancel(id);
        }
        self.drain_control();
    }

    /// A client went away; cancel its requests except diverted downloads,
    /// and drop anything queued for its blocked views.
    pub fn cancel_all_for_client(&mut self, client_id: u32) {
        for id in self.registry.matching_ids(client_id, None, true) {
            self.cancel(id, false);
        }
        for view_id in self.blocked.views_for_client(client_id) {
            let dropped = self.blocked.take(client_id, view_id);
            if !dropped.is_empty() {
                log::debug!(
                    "dropped {} queued requests for departed client {}",
                    dropped.len(),
                    client_id
                );
            }
        }
        self.drain_control();
    }

    /// Cancel the in-flight requests of one view, except downloads.
    pub fn cancel_all_for_view(&mut self, client_id: u32, view_id: u32) {
        for id in self.registry.matching_ids(client_id, Some(view_id), true) {
            self.cancel(id, false);
        }
        self.drain_control();
    }

    /// Apply one client pause (`true`) or resume (`false`) vote.
    pub fn pause(&mut self, id: GlobalRequestId, pause: bool) {
        self.pause_internal(id, pause);
        self.drain_control();
    }

    /// Acknowledge one data message, releasing backpressure if the client
    /// just caught up.
    pub fn ack_data(&mut self, id: GlobalRequestId) {
        let release = match self.registry.get_mut(id) {
            Some(request) => request.flow.record_data_ack(),
            // Acks racing a completed request are normal.
            None => false,
        };
        if release {
            log::debug!("client caught up on {}; releasing backpressure", id);
            self.pause_internal(id, false);
        }
        self.drain_control();
    }

    /// Acknowledge an upload progress report, allowing the next one.
    pub fn ack_upload_progress(&mut self, id: GlobalRequestId) {
        if let Some(request) = self.registry.get_mut(id) {
            request.waiting_for_upload_progress_ack = false;
        }
    }

    /// Hold new requests targeting a view.
    pub fn block_requests_for_view(&mut self, client_id: u32, view_id: u32) {
        self.blocked.block(client_id, view_id);
    }

    /// Unblock a view and start its queued requests in arrival order.
    pub fn resume_blocked_requests_for_view(&mut self, client_id: u32, view_id: u32) {
        let queued = self.blocked.take(client_id, view_id);
        log::debug!(
            "resuming view {}:{} with {} queued requests",
            client_id,
            view_id,
            queued.len()
        );
        for descriptor in queued {
            if let Err(error) = self.begin(descriptor) {
                log::debug!("queued request failed to start: {}", error);
            }
        }
    }

    /// Unblock a view, completing everything it queued as aborted.
    pub fn cancel_blocked_requests_for_view(&mut self, client_id: u32, view_id: u32) {
        for descriptor in self.blocked.take(client_id, view_id) {
            self.send_failure(&descriptor, DispatchError::Aborted);
        }
    }

    /// Mark (or clear) a view as mid cross-site navigation. The next
    /// main-frame request for it gets a handoff hold on its response.
    pub fn set_cross_site_pending(&mut self, client_id: u32, view_id: u32, pending: bool) {
        if pending {
            self.cross_site_pending.insert((client_id, view_id));
        } else {
            self.cross_site_pending.remove(&(client_id, view_id));
        }
    }

    /// The outgoing page finished unloading; release the held response.
    pub fn on_close_page_ack(&mut self, id: GlobalRequestId) {
        self.resume_deferred(id);
    }

    /// Answer a pending auth challenge. `None` continues without
    /// credentials.
    pub fn resolve_auth(&mut self, id: GlobalRequestId, credentials: Option<AuthCredentials>) {
        let Some(request) = self.registry.get_mut(id) else {
            log::warn!("auth response for unknown request {}", id);
            return;
        };
        if request.auth_challenge.take().is_none() {
            log::warn!("auth response for {} with no pending challenge", id);
            return;
        }
        request.transport.set_auth(credentials);
    }

    /// Answer a pending certificate error.
    pub fn resolve_ssl_error(&mut self, id: GlobalRequestId, proceed: bool, remember: bool) {
        let error = {
            let Some(request) = self.registry.get_mut(id) else {
                log::warn!("ssl decision for unknown request {}", id);
                return;
            };
            match request.pending_ssl_error.take() {
                Some(error) => error,
                None => {
                    log::warn!("ssl decision for {} with no pending error", id);
                    return;
                }
            }
        };
        if proceed {
            if remember {
                if let Some(request) = self.registry.get(id) {
                    if let Some(ssl) = request.transport.ssl_info() {
                        let cert_id = self.cert_store.store(&ssl.cert_der, id.client_id);
                        self.cert_store.remember_decision(cert_id);
                    }
                }
            }
            if let Some(request) = self.registry.get_mut(id) {
                request.transport.continue_despite_ssl_error();
            }
            return;
        }
        let pending = match self.registry.get_mut(id) {
            Some(request) => {
                request.transport.cancel();
                request.transport.has_pending_io()
            }
            None => return,
        };
        if !pending {
            self.finish_completion(id, Err(DispatchError::SslError(error)));
        }
        self.drain_control();
    }

    /// The embedder created the file for a download; reads may flow.
    pub fn on_download_file_ready(&mut self, download_id: u32) {
        let id = self
            .registry
            .iter()
            .find(|(_, request)| request.download_id == Some(download_id))
            .map(|(id, _)| *id);
        match id {
            Some(id) => self.pause(id, false),
            None => log::warn!("file ready for unknown download {}", download_id),
        }
    }

    /// Cancel everything and refuse further work.
    pub fn shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        self.is_shutdown = true;
        log::debug!(
            "shutting down with {} pending requests",
            self.registry.len()
        );
        for id in self.registry.ids() {
            if let Some(request) = self.registry.get_mut(id) {
                request.deferred = None;
                request.transport.cancel();
            }
            self.finish_completion(id, Err(DispatchError::Aborted));
        }
        for descriptor in self.blocked.drain_all() {
            self.send_failure(&descriptor, DispatchError::Aborted);
        }
        self.drain_control();
    }

    // ---- transport events --------------------------------------------

    /// The transport produced response metadata (or failed trying).
    pub fn on_transport_response_started(&mut self, id: GlobalRequestId) {
        let failed = match self.registry.get(id) {
            Some(request) => !request.transport.status().is_success(),
            None => {
                log::warn!("response started for unknown request {}", id);
                return;
            }
        };
        if failed {
            self.finish_from_transport(id);
        } else {
            self.deliver_response_started(id);
        }
        self.drain_control();
    }

    /// The transport is being redirected.
    pub fn on_transport_redirect(&mut self, id: GlobalRequestId, new_url: Url) {
        if !self.registry.contains(id) {
            log::warn!("redirect for unknown request {}", id);
            return;
        }
        if !self.policy.can_request_url(id.client_id, &new_url) {
            log::warn!("client {} denied redirect to {}", id.client_id, new_url);
            if let Some(request) = self.registry.get_mut(id) {
                request.transport.cancel();
            }
            self.finish_completion(id, Err(DispatchError::PolicyDenied));
            self.drain_control();
            return;
        }
        let (decision, head) = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            let head = request.transport.response_head();
            let decision = request.chain.on_request_redirected(id, &new_url, &head);
            (decision, head)
        };
        match decision {
            Decision::Continue => {
                if let Some(request) = self.registry.get_mut(id) {
                    request.url = new_url.clone();
                }
                for observer in &mut self.observers {
                    observer.on_request_redirected(id, &new_url);
                }
            }
            Decision::Defer => {
                if let Some(request) = self.registry.get_mut(id) {
                    request.deferred = Some(DeferredEvent::Redirect(new_url, head));
                }
            }
            Decision::Cancel => self.start_cancel(id),
        }
        self.drain_control();
    }

    /// An asynchronous read finished. An empty chunk is end of stream.
    pub fn on_transport_read_completed(&mut self, id: GlobalRequestId, data: Vec<u8>) {
        self.handle_read_completed(id, data);
        self.drain_control();
    }

    /// The transport failed outside a read; completes with its status.
    pub fn on_transport_failed(&mut self, id: GlobalRequestId) {
        self.finish_from_transport(id);
        self.drain_control();
    }

    /// The transport hit an authentication challenge.
    pub fn on_auth_required(&mut self, id: GlobalRequestId, challenge: AuthChallenge) {
        let Some(request) = self.registry.get_mut(id) else {
            log::warn!("auth challenge for unknown request {}", id);
            return;
        };
        request.auth_challenge = Some(challenge.clone());
        self.client
            .send(ClientMessage::AuthNeeded { id, challenge });
    }

    /// The transport hit a certificate error. Remembered decisions are
    /// honored immediately; otherwise the error goes to the client.
    pub fn on_ssl_certificate_error(&mut self, id: GlobalRequestId, error: i32) {
        let Some(request) = self.registry.get_mut(id) else {
            log::warn!("ssl error for unknown request {}", id);
            return;
        };
        let cert_id = match request.transport.ssl_info() {
            Some(ssl) => self.cert_store.store(&ssl.cert_der, id.client_id),
            None => 0,
        };
        if cert_id != 0 && self.cert_store.is_remembered(cert_id) {
            log::debug!(
                "proceeding past remembered certificate error {} on {}",
                error,
                id
            );
            request.transport.continue_despite_ssl_error();
            return;
        }
        request.pending_ssl_error = Some(error);
        self.client
            .send(ClientMessage::SslCertificateError { id, error, cert_id });
    }

    /// Verdict for a pending URL reputation check.
    pub fn on_url_check_result(&mut self, id: GlobalRequestId, verdict: UrlCheckVerdict) {
        let handle = match self.registry.get(id) {
            Some(request) => request.url_check.clone(),
            None => {
                log::debug!("reputation verdict for finished request {}", id);
                return;
            }
        };
        let Some(handle) = handle else {
            log::warn!("reputation verdict for {} with no check attached", id);
            return;
        };
        if !handle.is_in_flight() {
            log::debug!("late reputation verdict for {}", id);
            return;
        }
        handle.resolve(verdict);
        match verdict {
            UrlCheckVerdict::Safe => self.resume_deferred(id),
            UrlCheckVerdict::Malicious => {
                log::warn!("aborting request {}: flagged by reputation check", id);
                if let Some(request) = self.registry.get_mut(id) {
                    request.deferred = None;
                    request.transport.cancel();
                }
                self.finish_completion(id, Err(DispatchError::Aborted));
            }
        }
        self.drain_control();
    }

    /// Replay whatever event a handler (or hold) parked.
    pub fn resume_deferred(&mut self, id: GlobalRequestId) {
        let event = match self.registry.get_mut(id) {
            Some(request) => request.deferred.take(),
            None => {
                log::warn!("deferred resume for unknown request {}", id);
                return;
            }
        };
        let Some(event) = event else {
            log::debug!("deferred resume for {} with nothing parked", id);
            return;
        };
        match event {
            DeferredEvent::WillStart(url) => {
                let decision = match self.registry.get_mut(id) {
                    Some(request) => request.chain.on_will_start(id, &url),
                    None => return,
                };
                match decision {
                    Decision::Continue => {
                        if let Some(request) = self.registry.get_mut(id) {
                            request.transport.start();
                        }
                    }
                    Decision::Defer => {
                        if let Some(request) = self.registry.get_mut(id) {
                            request.deferred = Some(DeferredEvent::WillStart(url));
                        }
                    }
                    Decision::Cancel => self.finish_completion(id, Err(DispatchError::Aborted)),
                }
            }
            DeferredEvent::Redirect(new_url, head) => {
                let decision = match self.registry.get_mut(id) {
                    Some(request) => request.chain.on_request_redirected(id, &new_url, &head),
                    None => return,
                };
                match decision {
                    Decision::Continue => {
                        if let Some(request) = self.registry.get_mut(id) {
                            request.url = new_url.clone();
                            request.transport.follow_deferred_redirect(&new_url);
                        }
                        for observer in &mut self.observers {
                            observer.on_request_redirected(id, &new_url);
                        }
                    }
                    Decision::Defer => {
                        if let Some(request) = self.registry.get_mut(id) {
                            request.deferred = Some(DeferredEvent::Redirect(new_url, head));
                        }
                    }
                    Decision::Cancel => self.start_cancel(id),
                }
            }
            DeferredEvent::ResponseStarted(head) => {
                let decision = match self.registry.get_mut(id) {
                    Some(request) => request.chain.on_response_started(id, &head),
                    None => return,
                };
                match decision {
                    Decision::Continue => self.issue_read(id),
                    Decision::Defer => {
                        if let Some(request) = self.registry.get_mut(id) {
                            request.deferred = Some(DeferredEvent::ResponseStarted(head));
                        }
                    }
                    Decision::Cancel => self.start_cancel(id),
                }
            }
            DeferredEvent::Read => self.issue_read(id),
            DeferredEvent::ReadChunk(data) => {
                let decision = match self.registry.get_mut(id) {
                    Some(request) => request.chain.on_read_completed(id, &data),
                    None => return,
                };
                match decision {
                    Decision::Continue => {
                        self.drain_control();
                        self.continue_reading(id);
                    }
                    Decision::Defer => {
                        if let Some(request) = self.registry.get_mut(id) {
                            request.deferred = Some(DeferredEvent::ReadChunk(data));
                        }
                    }
                    Decision::Cancel => self.start_cancel(id),
                }
            }
            DeferredEvent::Completion(status) => self.finish_completion(id, status),
        }
        self.drain_control();
    }

    /// Run one maintenance pass: load states, upload progress, reputation
    /// check timeouts and download write-side flow.
    pub fn tick(&mut self, now: Instant) {
        self.update_load_states();
        self.update_upload_progress(now);
        self.expire_url_checks(now);
        self.update_download_flow();
        self.drain_control();
    }

    // ---- internals ---------------------------------------------------

    fn send_failure(&self, descriptor: &RequestDescriptor, error: DispatchError) {
        let id = descriptor.id();
        if descriptor.sync_load {
            self.client.send(ClientMessage::SyncLoadResult {
                id,
                status: Err(error),
                response: Default::default(),
                data: Vec::new(),
            });
        } else {
            self.client.send(ClientMessage::RequestComplete {
                id,
                status: Err(error),
            });
        }
    }

    fn start_request(&mut self, descriptor: RequestDescriptor) {
        let id = descriptor.id();
        let url = descriptor.url.clone();

        let mut chain: Box<dyn ResourceHandler> = if descriptor.sync_load {
            Box::new(SyncReplyHandler::new(self.client.clone()))
        } else {
            Box::new(AsyncReplyHandler::new(self.client.clone(), self.handle()))
        };
        if !descriptor.sync_load
            && descriptor.kind == ResourceKind::MainFrame
            && self
                .cross_site_pending
                .remove(&(descriptor.client_id, descriptor.view_id))
        {
            chain = Box::new(CrossSiteHandler::new(
                chain,
                self.client.clone(),
                descriptor.client_id,
                descriptor.view_id,
            ));
        }
        let mut url_check = None;
        if self.checker.enabled() && self.checker.can_check_url(&url) {
            let gate = SafeBrowsingHandler::new(chain, Arc::clone(&self.checker));
            url_check = Some(gate.check_handle());
            chain = Box::new(gate);
        }
        if !descriptor.sync_load {
            chain = Box::new(BufferingHandler::new(
                chain,
                self.client.clone(),
                self.handle(),
                Arc::clone(&self.plugins),
                Arc::clone(&self.next_download_id),
                descriptor.client_id,
                descriptor.view_id,
                descriptor.kind.is_frame(),
                url.clone(),
            ));
        }

        let transport = self.factory.create(descriptor.transport_request());
        let mut request = Request::new(
            id,
            descriptor.view_id,
            url.clone(),
            descriptor.kind,
            descriptor.load_flags,
            descriptor.mixed_content,
            descriptor.upload_size(),
            transport,
            chain,
        );
        request.url_check = url_check;
        self.registry.insert(request);
        for observer in &mut self.observers {
            observer.on_request_started(id, &url);
        }
        log::debug!(
            "beginning request {}: {} {}",
            id,
            descriptor.method,
            url
        );
        self.start_transport(id);
        self.drain_control();
    }

    /// Deliver `on_will_start` and start the transport unless held.
    fn start_transport(&mut self, id: GlobalRequestId) {
        let (decision, url) = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            let url = request.url.clone();
            (request.chain.on_will_start(id, &url), url)
        };
        match decision {
            Decision::Continue => {
                if let Some(request) = self.registry.get_mut(id) {
                    request.transport.start();
                }
            }
            Decision::Defer => {
                if let Some(request) = self.registry.get_mut(id) {
                    request.deferred = Some(DeferredEvent::WillStart(url));
                }
            }
            Decision::Cancel => self.finish_completion(id, Err(DispatchError::Aborted)),
        }
    }

    fn deliver_response_started(&mut self, id: GlobalRequestId) {
        let parked = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            if request.flow.pause_if_needed() {
                request.flow.park_response();
                true
            } else {
                false
            }
        };
        if parked {
            log::debug!("parking response for paused request {}", id);
            return;
        }
        {
            // The upload is over once a response exists; force a final
            // progress report so the consumer sees 100%.
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            if request.load_flags.report_upload_progress
                && request.upload_size > 0
                && request.last_upload_position < request.upload_size
            {
                let size = request.upload_size;
                request.chain.on_upload_progress(id, size, size);
                request.last_upload_position = size;
                request.waiting_for_upload_progress_ack = true;
            }
        }
        let head = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            let mut head = request.transport.response_head();
            if let Some(ssl) = request.transport.ssl_info() {
                head.cert_id = self.cert_store.store(&ssl.cert_der, id.client_id);
            }
            head
        };
        let decision = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            request.chain.on_response_started(id, &head)
        };
        match decision {
            Decision::Continue => self.issue_read(id),
            Decision::Defer => {
                if let Some(request) = self.registry.get_mut(id) {
                    request.deferred = Some(DeferredEvent::ResponseStarted(head));
                }
            }
            Decision::Cancel => self.start_cancel(id),
        }
    }

    /// Issue the next body read and dispatch its outcome.
    fn issue_read(&mut self, id: GlobalRequestId) {
        let decision = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            request.chain.on_will_read(id)
        };
        match decision {
            Decision::Cancel => {
                self.start_cancel(id);
                return;
            }
            Decision::Defer => {
                if let Some(request) = self.registry.get_mut(id) {
                    request.deferred = Some(DeferredEvent::Read);
                }
                return;
            }
            Decision::Continue => {}
        }
        let outcome = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            request.flow.mark_reading();
            request.transport.read(READ_CHUNK_SIZE)
        };
        match outcome {
            ReadOutcome::Pending => {}
            ReadOutcome::Ready(data) => self.handle_read_completed(id, data),
            ReadOutcome::Eof => self.finish_from_transport(id),
        }
    }

    fn handle_read_completed(&mut self, id: GlobalRequestId, data: Vec<u8>) {
        {
            let Some(request) = self.registry.get_mut(id) else {
                log::warn!("read completion for unknown request {}", id);
                return;
            };
            if request.flow.pause_if_needed() {
                log::debug!(
                    "parking {} byte chunk for paused request {}",
                    data.len(),
                    id
                );
                request.flow.park_chunk(data);
                return;
            }
            let status = request.transport.status();
            if !(status.is_success() || status.is_io_pending()) {
                drop(request);
                self.finish_from_transport(id);
                return;
            }
        }
        if data.is_empty() {
            self.finish_from_transport(id);
            return;
        }
        let decision = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            request.chain.on_read_completed(id, &data)
        };
        match decision {
            Decision::Defer => {
                if let Some(request) = self.registry.get_mut(id) {
                    request.deferred = Some(DeferredEvent::ReadChunk(data));
                }
                return;
            }
            Decision::Cancel => {
                self.start_cancel(id);
                return;
            }
            Decision::Continue => {}
        }
        self.drain_control();
        self.continue_reading(id);
    }

    /// Issue the next read after a delivered chunk. Synchronously ready
    /// data is parked and redelivered through the control queue so one
    /// fast transport cannot monopolize the dispatcher.
    fn continue_reading(&mut self, id: GlobalRequestId) {
        let next = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            if request.flow.pause_if_needed() || request.deferred.is_some() {
                return;
            }
            request.flow.mark_reading();
            request.transport.read(READ_CHUNK_SIZE)
        };
        match next {
            ReadOutcome::Pending => {}
            ReadOutcome::Eof => self.finish_from_transport(id),
            ReadOutcome::Ready(next_chunk) => {
                if let Some(request) = self.registry.get_mut(id) {
                    request.flow.force_pause();
                    request.flow.park_chunk(next_chunk);
                }
                let _ = self.control_tx.send(ControlMessage::Resume(id));
            }
        }
    }

    fn finish_from_transport(&mut self, id: GlobalRequestId) {
        let status = match self.registry.get(id) {
            Some(request) => request.transport.status().as_completion(),
            None => return,
        };
        self.finish_completion(id, status);
    }

    /// Deliver the terminal event. Completions are never held back by the
    /// pause dimension; only an explicit `Defer` parks one.
    fn finish_completion(&mut self, id: GlobalRequestId, status: CompletionStatus) {
        let decision = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            request.chain.on_response_completed(id, &status)
        };
        match decision {
            Decision::Defer => {
                if let Some(request) = self.registry.get_mut(id) {
                    request.deferred = Some(DeferredEvent::Completion(status));
                }
                return;
            }
            Decision::Cancel => {
                log::warn!("handler cancelled {} at completion; removing anyway", id);
            }
            Decision::Continue => {}
        }
        self.remove_request(id, &status);
    }

    fn remove_request(&mut self, id: GlobalRequestId, status: &CompletionStatus) {
        let Some(request) = self.registry.remove(id) else {
            return;
        };
        if request.auth_challenge.is_some() {
            self.client.send(ClientMessage::AuthPromptCancelled { id });
        }
        if let Some(check) = &request.url_check {
            if check.is_in_flight() {
                self.checker.cancel_check(id);
                check.cancel();
            }
        }
        for observer in &mut self.observers {
            observer.on_request_completed(id, status);
        }
        log::debug!("request {} finished: {:?}", id, status);
    }

    /// Cancel the transport; finish synchronously if no IO is in flight.
    fn start_cancel(&mut self, id: GlobalRequestId) {
        let pending = match self.registry.get_mut(id) {
            Some(request) => {
                request.transport.cancel();
                request.transport.has_pending_io()
            }
            None => return,
        };
        if pending {
            log::debug!("cancel of {} waiting on transport", id);
        } else {
            self.finish_from_transport(id);
        }
    }

    fn pause_internal(&mut self, id: GlobalRequestId, pause: bool) {
        let adjust = match self.registry.get_mut(id) {
            Some(request) => request.flow.adjust(pause),
            None => {
                log::warn!("pause adjustment for unknown request {}", id);
                return;
            }
        };
        match adjust {
            PauseAdjust::Paused => log::debug!("paused request {}", id),
            PauseAdjust::ScheduleResume => self.resume_request(id),
            PauseAdjust::Unbalanced => {}
        }
    }

    /// Resume the pause dimension: replay whatever was parked while the
    /// request was paused. Never touches deferral holds.
    fn resume_request(&mut self, id: GlobalRequestId) {
        enum Resume {
            Chunk(Vec<u8>),
            Response,
            Read,
            Nothing,
        }
        let action = {
            let Some(request) = self.registry.get_mut(id) else {
                return;
            };
            if !request.flow.is_paused() {
                return;
            }
            request.flow.mark_resumed();
            if let Some(chunk) = request.flow.take_parked_chunk() {
                Resume::Chunk(chunk)
            } else if request.flow.take_parked_response() {
                Resume::Response
            } else if request.flow.has_started_reading() {
                Resume::Read
            } else {
                Resume::Nothing
            }
        };
        log::debug!("resuming request {}", id);
        match action {
            Resume::Chunk(chunk) => self.handle_read_completed(id, chunk),
            Resume::Response => self.deliver_response_started(id),
            Resume::Read => self.issue_read(id),
            Resume::Nothing => {}
        }
    }

    /// Apply queued handler commands. Runs after every delivery so a
    /// handler's requests take effect before the next event.
    fn drain_control(&mut self) {
        while let Ok(message) = self.control_rx.try_recv() {
            match message {
                ControlMessage::Pause(id) => self.pause_internal(id, true),
                ControlMessage::Resume(id) => self.resume_request(id),
                ControlMessage::Cancel(id) => self.cancel(id, false),
                ControlMessage::DataSent(id) => {
                    let crossed = match self.registry.get_mut(id) {
                        Some(request) => request.flow.record_data_sent(),
                        None => false,
                    };
                    if crossed {
                        log::debug!("client behind on {}; pausing reads", id);
                        self.pause_internal(id, true);
                    }
                }
                ControlMessage::MarkDownload {
                    id,
                    download_id,
                    sink,
                } => {
                    if let Some(request) = self.registry.get_mut(id) {
                        request.is_download = true;
                        request.download_id = Some(download_id);
                        request.download_sink = Some(sink);
                    }
                }
            }
        }
    }

    fn update_load_states(&mut self) {
        let mut samples = Vec::new();
        for (id, request) in self.registry.iter_mut() {
            let state = request.transport.load_state();
            request.last_load_state = state;
            samples.push(LoadInfo {
                client_id: id.client_id,
                view_id: request.view_id,
                url: request.url.clone(),
                state,
            });
        }
        for info in samples {
            self.load_states.record(info);
        }
        for update in self.load_states.take_updates() {
            self.client.send(ClientMessage::LoadStateChanged {
                client_id: update.client_id,
                view_id: update.view_id,
                url: update.url,
                state: update.state,
            });
        }
    }

    /// Report upload progress, throttled to meaningful increments and one
    /// unacked report at a time.
    fn update_upload_progress(&mut self, now: Instant) {
        let ids: Vec<GlobalRequestId> = self
            .registry
            .iter()
            .filter(|(_, request)| {
                request.load_flags.report_upload_progress && request.upload_size > 0
            })
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(request) = self.registry.get_mut(id) else {
                continue;
            };
            if request.waiting_for_upload_progress_ack {
                continue;
            }
            let size = request.upload_size;
            let position = request.transport.upload_progress();
            if position == request.last_upload_position {
                continue;
            }
            let finished = position == size;
            let enough_progress =
                position - request.last_upload_position > size / UPLOAD_PROGRESS_INCREMENTS;
            let too_long_ago = request
                .last_upload_report
                .is_none_or(|last| now.duration_since(last) > UPLOAD_PROGRESS_MAX_AGE);
            if finished || enough_progress || too_long_ago {
                request.chain.on_upload_progress(id, position, size);
                request.waiting_for_upload_progress_ack = true;
                request.last_upload_position = position;
                request.last_upload_report = Some(now);
            }
        }
    }

    /// A reputation check that outlived its deadline resolves as safe.
    fn expire_url_checks(&mut self, now: Instant) {
        let expired: Vec<GlobalRequestId> = self
            .registry
            .iter()
            .filter(|(_, request)| {
                request
                    .url_check
                    .as_ref()
                    .is_some_and(|check| check.timed_out(now))
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            log::warn!("reputation check for {} timed out; treating as safe", id);
            if let Some(request) = self.registry.get(id) {
                if let Some(check) = &request.url_check {
                    self.checker.cancel_check(id);
                    check.resolve(UrlCheckVerdict::Safe);
                }
            }
            self.resume_deferred(id);
        }
    }

    /// Pause downloads whose file writer has fallen behind; resume them
    /// once the backlog drains.
    fn update_download_flow(&mut self) {
        let mut changes = Vec::new();
        for (id, request) in self.registry.iter_mut() {
            let Some(sink) = &request.download_sink else {
                continue;
            };
            let backlog = sink.len();
            if backlog > MAX_QUEUED_DOWNLOAD_CHUNKS && !request.write_paused {
                request.write_paused = true;
                changes.push((*id, true));
            } else if backlog < MAX_QUEUED_DOWNLOAD_CHUNKS && request.write_paused {
                request.write_paused = false;
                changes.push((*id, false));
            }
        }
        for (id, pause) in changes {
            log::debug!(
                "download write backlog {} request {}",
                if pause { "pausing" } else { "resuming" },
                id
            );
            self.pause_internal(id, pause);
        }
    }
}

/// Drive the dispatcher's maintenance pass until shutdown.
pub async fn run_tick_loop(dispatcher: Arc<Mutex<ResourceDispatcher>>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;
        let mut guard = match dispatcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_shutdown() {
            break;
        }
        guard.tick(Instant::now());
    }
}
