//! Transport abstraction for the dispatch pipeline
//!
//! The pipeline never speaks HTTP itself. A [`Transport`] is one in-flight
//! fetch owned by its request; the network layer drives it and reports
//! progress back through the dispatcher's `on_transport_*` entry points.
//! [`mock`] provides a scriptable implementation for tests.

pub mod mock;

use std::collections::HashMap;
use std::path::PathBuf;

use url::Url;

use crate::utils::{CompletionStatus, DispatchError};

/// Transport-reported progress of one request.
///
/// The states are listed in the order they occur during the lifetime of a
/// request, so a larger value means the request is further along. The
/// load-state tracker relies on this ordering to pick the most advanced
/// state per view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadState {
    #[default]
    Idle,
    WaitingForCache,
    ResolvingHost,
    Connecting,
    SendingRequest,
    WaitingForResponse,
    /// Transferring data - the most interesting state to report
    ReadingResponse,
}

/// Outcome of the last transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Success,
    IoPending,
    Canceled,
    Failed(i32),
}

impl TransportStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransportStatus::Success)
    }

    pub fn is_io_pending(&self) -> bool {
        matches!(self, TransportStatus::IoPending)
    }

    /// Map the transport status onto the completion taxonomy.
    pub fn as_completion(&self) -> CompletionStatus {
        match self {
            TransportStatus::Success => Ok(()),
            TransportStatus::Canceled => Err(DispatchError::Aborted),
            TransportStatus::Failed(code) => Err(DispatchError::TransportError(*code)),
            // A completion should never be derived from an in-flight read.
            TransportStatus::IoPending => Err(DispatchError::TransportError(-1)),
        }
    }
}

/// Response metadata delivered through `on_response_started`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status_code: u16,
    pub mime_type: String,
    pub charset: String,
    /// -1 when the server did not declare a length
    pub content_length: i64,
    pub content_disposition: String,
    pub headers: HashMap<String, String>,
    /// Certificate id from the cert store, 0 when the response is not secure
    pub cert_id: u32,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status_code: 200,
            mime_type: String::new(),
            charset: String::new(),
            content_length: -1,
            content_disposition: String::new(),
            headers: HashMap::new(),
            cert_id: 0,
        }
    }
}

/// Certificate material reported by a secure transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslInfo {
    pub cert_der: Vec<u8>,
    pub cert_status: u32,
    pub security_bits: i32,
}

/// A server or proxy authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub host: String,
    pub realm: String,
    pub is_proxy: bool,
}

/// Credentials replayed into the transport after an auth prompt resolves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

/// One element of an upload body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadElement {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Result of a synchronous read attempt.
///
/// `Ready` never carries an empty chunk; end of stream is `Eof`. `Pending`
/// means the completion will arrive later through
/// `on_transport_read_completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Ready(Vec<u8>),
    Pending,
    Eof,
}

/// What the dispatcher hands the factory to open a fetch
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub method: String,
    pub referrer: Option<Url>,
    pub headers: HashMap<String, String>,
    pub upload: Vec<UploadElement>,
    /// Serve only from cache (save-page fetches)
    pub cache_only: bool,
    pub report_upload_progress: bool,
}

impl TransportRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            referrer: None,
            headers: HashMap::new(),
            upload: Vec::new(),
            cache_only: false,
            report_upload_progress: false,
        }
    }
}

/// One in-flight fetch.
///
/// All methods are invoked from the IO context only. `start` and `read`
/// never block; asynchronous completions re-enter the dispatcher through
/// its transport event entry points.
pub trait Transport: Send {
    /// Begin the fetch. Progress arrives via dispatcher entry points.
    fn start(&mut self);

    /// Attempt to read up to `max_bytes` of response body.
    fn read(&mut self, max_bytes: usize) -> ReadOutcome;

    /// Cooperatively cancel. If IO is outstanding the transport reports a
    /// cancelled completion later; otherwise the caller removes the request
    /// synchronously.
    fn cancel(&mut self);

    /// Follow a redirect whose delivery was deferred by a handler.
    fn follow_deferred_redirect(&mut self, new_url: &Url);

    /// Resolve an authentication challenge. `None` continues without
    /// credentials.
    fn set_auth(&mut self, credentials: Option<AuthCredentials>);

    /// Proceed past a certificate error after a Continue decision.
    fn continue_despite_ssl_error(&mut self);

    fn status(&self) -> TransportStatus;

    /// Whether an asynchronous operation is outstanding
    fn has_pending_io(&self) -> bool;

    fn url(&self) -> Url;

    fn response_head(&self) -> ResponseHead;

    fn ssl_info(&self) -> Option<SslInfo>;

    fn load_state(&self) -> LoadState;

    /// Bytes of the upload body sent so far
    fn upload_progress(&self) -> u64;
}

/// Creates transports for accepted requests.
pub trait TransportFactory: Send {
    /// Whether the transport layer can service this scheme at all. Frame
    /// loads for unhandled schemes are diverted to an external launcher.
    fn handles_scheme(&self, scheme: &str) -> bool;

    fn create(&mut self, request: TransportRequest) -> Box<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_state_ordering() {
        assert!(LoadState::Idle < LoadState::ResolvingHost);
        assert!(LoadState::ResolvingHost < LoadState::Connecting);
        assert!(LoadState::WaitingForResponse < LoadState::ReadingResponse);
    }

    #[test]
    fn test_status_completion_mapping() {
        assert_eq!(TransportStatus::Success.as_completion(), Ok(()));
        assert_eq!(
            TransportStatus::Canceled.as_completion(),
            Err(DispatchError::Aborted)
        );
        assert_eq!(
            TransportStatus::Failed(-105).as_completion(),
            Err(DispatchError::TransportError(-105))
        );
    }

    #[test]
    fn test_response_head_default_length_unknown() {
        assert_eq!(ResponseHead::default().content_length, -1);
    }
}
