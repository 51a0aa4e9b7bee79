//! Per-request state owned by the dispatch pipeline

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use url::Url;

use crate::dispatch::flow::FlowController;
use crate::handler::ResourceHandler;
use crate::handler::download::DownloadBuffer;
use crate::handler::safe_browsing::UrlCheckHandle;
use crate::transport::{
    AuthChallenge, LoadState, ResponseHead, Transport, TransportRequest, UploadElement,
};
use crate::utils::CompletionStatus;

/// Composite id uniquely identifying one in-flight request.
///
/// `client_id` names the requesting logical client (render process);
/// `request_id` is unique within that client. Dispatcher-initiated fetches
/// use negative request ids so they can never collide with client ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalRequestId {
    pub client_id: u32,
    pub request_id: i32,
}

impl GlobalRequestId {
    pub fn new(client_id: u32, request_id: i32) -> Self {
        Self {
            client_id,
            request_id,
        }
    }
}

impl fmt::Display for GlobalRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.request_id)
    }
}

/// What kind of resource a request is loading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Top-level document
    MainFrame,
    SubFrame,
    /// Images, scripts, stylesheets, fetches
    SubResource,
}

impl ResourceKind {
    /// Frame loads are eligible for download diversion and external
    /// protocol launching.
    pub fn is_frame(&self) -> bool {
        matches!(self, ResourceKind::MainFrame | ResourceKind::SubFrame)
    }
}

/// Load behavior modifiers carried on the descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadFlags {
    /// Serve from cache only (save-page fetches)
    pub cache_only: bool,
    /// Report throttled upload progress to the consumer
    pub report_upload_progress: bool,
}

/// Everything a client supplies when asking for a resource load
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub client_id: u32,
    pub view_id: u32,
    pub request_id: i32,
    pub url: Url,
    pub referrer: Option<Url>,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub upload: Vec<UploadElement>,
    pub kind: ResourceKind,
    pub load_flags: LoadFlags,
    pub mixed_content: bool,
    /// Collect the whole reply into a single synchronous result message
    pub sync_load: bool,
}

impl RequestDescriptor {
    pub fn new(client_id: u32, view_id: u32, request_id: i32, url: Url) -> Self {
        Self {
            client_id,
            view_id,
            request_id,
            url,
            referrer: None,
            method: "GET".to_string(),
            headers: HashMap::new(),
            upload: Vec::new(),
            kind: ResourceKind::SubResource,
            load_flags: LoadFlags::default(),
            mixed_content: false,
            sync_load: false,
        }
    }

    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn with_referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_upload(mut self, upload: Vec<UploadElement>) -> Self {
        self.upload = upload;
        self
    }

    pub fn with_load_flags(mut self, load_flags: LoadFlags) -> Self {
        self.load_flags = load_flags;
        self
    }

    pub fn with_mixed_content(mut self, mixed_content: bool) -> Self {
        self.mixed_content = mixed_content;
        self
    }

    pub fn sync_load(mut self) -> Self {
        self.sync_load = true;
        self
    }

    pub fn id(&self) -> GlobalRequestId {
        GlobalRequestId::new(self.client_id, self.request_id)
    }

    /// Total size of the byte elements of the upload body. File elements
    /// are sized by the transport when it opens them.
    pub fn upload_size(&self) -> u64 {
        self.upload
            .iter()
            .map(|e| match e {
                UploadElement::Bytes(b) => b.len() as u64,
                UploadElement::File(_) => 0,
            })
            .sum()
    }

    /// Build the transport-facing view of this descriptor
    pub fn transport_request(&self) -> TransportRequest {
        TransportRequest {
            url: self.url.clone(),
            method: self.method.clone(),
            referrer: self.referrer.clone(),
            headers: self.headers.clone(),
            upload: self.upload.clone(),
            cache_only: self.load_flags.cache_only,
            report_upload_progress: self.load_flags.report_upload_progress,
        }
    }
}

/// A chain delivery that was parked by a `Defer` decision (or by an
/// external hold) and will be replayed verbatim on resume.
#[derive(Debug)]
pub(crate) enum DeferredEvent {
    /// Replay `on_will_start`; the transport has not been started yet
    WillStart(Url),
    /// Replay a redirect, then tell the transport to follow it
    Redirect(Url, ResponseHead),
    ResponseStarted(ResponseHead),
    /// Resume by issuing the next read
    Read,
    /// Replay an undelivered body chunk
    ReadChunk(Vec<u8>),
    Completion(CompletionStatus),
}

/// One in-flight load: transport, handler chain and all lifecycle state.
///
/// Backpressure lives in [`FlowController`]; `deferred` is the orthogonal
/// hold dimension used for handler deferrals and pending auth/SSL
/// decisions. Resuming one never resumes the other.
pub struct Request {
    pub(crate) id: GlobalRequestId,
    pub(crate) view_id: u32,
    pub(crate) url: Url,
    pub(crate) kind: ResourceKind,
    pub(crate) load_flags: LoadFlags,
    pub(crate) mixed_content: bool,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) chain: Box<dyn ResourceHandler>,
    pub(crate) flow: FlowController,
    pub(crate) deferred: Option<DeferredEvent>,
    /// Pending auth prompt; must be told when the request goes away
    pub(crate) auth_challenge: Option<AuthChallenge>,
    /// Certificate error code awaiting a proceed/deny decision
    pub(crate) pending_ssl_error: Option<i32>,
    pub(crate) is_download: bool,
    /// Set once the response is diverted to a download sink
    pub(crate) download_id: Option<u32>,
    pub(crate) last_load_state: LoadState,
    pub(crate) upload_size: u64,
    pub(crate) last_upload_position: u64,
    pub(crate) waiting_for_upload_progress_ack: bool,
    pub(crate) last_upload_report: Option<Instant>,
    /// Attached while a safe-browsing check is in flight
    pub(crate) url_check: Option<UrlCheckHandle>,
    /// Attached once a download sink exists; drives write-side flow
    pub(crate) download_sink: Option<DownloadBuffer>,
    pub(crate) write_paused: bool,
}

impl Request {
    pub(crate) fn new(
        id: GlobalRequestId,
        view_id: u32,
        url: Url,
        kind: ResourceKind,
        load_flags: LoadFlags,
        mixed_content: bool,
        upload_size: u64,
        transport: Box<dyn Transport>,
        chain: Box<dyn ResourceHandler>,
    ) -> Self {
        Self {
            id,
            view_id,
            url,
            kind,
            load_flags,
            mixed_content,
            transport,
            chain,
            flow: FlowController::new(),
            deferred: None,
            auth_challenge: None,
            pending_ssl_error: None,
            is_download: false,
            download_id: None,
            last_load_state: LoadState::Idle,
            upload_size,
            last_upload_position: 0,
            waiting_for_upload_progress_ack: false,
            last_upload_report: None,
            url_check: None,
            download_sink: None,
            write_paused: false,
        }
    }

    pub fn id(&self) -> GlobalRequestId {
        self.id
    }

    pub fn view_id(&self) -> u32 {
        self.view_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_mixed_content(&self) -> bool {
        self.mixed_content
    }

    pub fn is_download(&self) -> bool {
        self.is_download
    }

    /// State sampled by the most recent maintenance tick
    pub fn last_load_state(&self) -> LoadState {
        self.last_load_state
    }

    /// Whether chain delivery is currently allowed
    pub fn can_deliver(&self) -> bool {
        !self.flow.is_paused() && self.deferred.is_none()
    }
}
