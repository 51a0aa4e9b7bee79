//! Scriptable in-memory transport for tests.
//!
//! A [`MockTransport`] is handed to the dispatcher while the test keeps a
//! [`MockTransportHandle`] onto the same state, scripting response heads
//! and body chunks and observing what the dispatcher asked the transport to
//! do. Asynchronous completions are simulated by the test calling the
//! dispatcher's `on_transport_*` entry points directly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use url::Url;

use super::{
    AuthCredentials, LoadState, ReadOutcome, ResponseHead, SslInfo, Transport, TransportFactory,
    TransportRequest, TransportStatus,
};

#[derive(Debug)]
struct MockState {
    url: Url,
    started: bool,
    cancelled: bool,
    status: TransportStatus,
    io_pending: bool,
    chunks: VecDeque<Vec<u8>>,
    eof_after_chunks: bool,
    response: ResponseHead,
    ssl: Option<SslInfo>,
    load_state: LoadState,
    upload_position: u64,
    auth_responses: Vec<Option<AuthCredentials>>,
    followed_redirects: Vec<Url>,
    ssl_continued: bool,
    reads_issued: usize,
}

/// Transport half, owned by the request under test
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Test half, retained by the test to script and inspect the transport
#[derive(Clone)]
pub struct MockTransportHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(url: Url) -> (Self, MockTransportHandle) {
        let state = Arc::new(Mutex::new(MockState {
            url,
            started: false,
            cancelled: false,
            status: TransportStatus::Success,
            io_pending: false,
            chunks: VecDeque::new(),
            eof_after_chunks: true,
            response: ResponseHead::default(),
            ssl: None,
            load_state: LoadState::Idle,
            upload_position: 0,
            auth_responses: Vec::new(),
            followed_redirects: Vec::new(),
            ssl_continued: false,
            reads_issued: 0,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockTransportHandle { state },
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl Transport for MockTransport {
    fn start(&mut self) {
        let mut s = self.lock();
        s.started = true;
        s.load_state = LoadState::WaitingForResponse;
    }

    fn read(&mut self, max_bytes: usize) -> ReadOutcome {
        let mut s = self.lock();
        s.reads_issued += 1;
        if s.cancelled {
            return ReadOutcome::Pending;
        }
        if let Some(mut chunk) = s.chunks.pop_front() {
            chunk.truncate(max_bytes);
            s.status = TransportStatus::Success;
            s.load_state = LoadState::ReadingResponse;
            ReadOutcome::Ready(chunk)
        } else if s.eof_after_chunks {
            s.status = TransportStatus::Success;
            ReadOutcome::Eof
        } else {
            s.status = TransportStatus::IoPending;
            s.io_pending = true;
            ReadOutcome::Pending
        }
    }

    fn cancel(&mut self) {
        let mut s = self.lock();
        s.cancelled = true;
        s.status = TransportStatus::Canceled;
    }

    fn follow_deferred_redirect(&mut self, new_url: &Url) {
        let mut s = self.lock();
        s.url = new_url.clone();
        s.followed_redirects.push(new_url.clone());
    }

    fn set_auth(&mut self, credentials: Option<AuthCredentials>) {
        self.lock().auth_responses.push(credentials);
    }

    fn continue_despite_ssl_error(&mut self) {
        self.lock().ssl_continued = true;
    }

    fn status(&self) -> TransportStatus {
        self.lock().status
    }

    fn has_pending_io(&self) -> bool {
        self.lock().io_pending
    }

    fn url(&self) -> Url {
        self.lock().url.clone()
    }

    fn response_head(&self) -> ResponseHead {
        self.lock().response.clone()
    }

    fn ssl_info(&self) -> Option<SslInfo> {
        self.lock().ssl.clone()
    }

    fn load_state(&self) -> LoadState {
        self.lock().load_state
    }

    fn upload_progress(&self) -> u64 {
        self.lock().upload_position
    }
}

impl MockTransportHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_response(&self, response: ResponseHead) {
        self.lock().response = response;
    }

    pub fn set_ssl_info(&self, ssl: SslInfo) {
        self.lock().ssl = Some(ssl);
    }

    /// Queue a body chunk to be returned from a synchronous read
    pub fn push_chunk(&self, chunk: impl Into<Vec<u8>>) {
        self.lock().chunks.push_back(chunk.into());
    }

    /// When `false`, a read past the queued chunks returns `Pending`
    /// instead of `Eof`, simulating an outstanding asynchronous read.
    pub fn set_eof_after_chunks(&self, eof: bool) {
        self.lock().eof_after_chunks = eof;
    }

    pub fn set_io_pending(&self, pending: bool) {
        let mut s = self.lock();
        s.io_pending = pending;
        if pending {
            s.status = TransportStatus::IoPending;
        }
    }

    pub fn set_status(&self, status: TransportStatus) {
        self.lock().status = status;
    }

    pub fn set_load_state(&self, state: LoadState) {
        self.lock().load_state = state;
    }

    pub fn set_upload_position(&self, position: u64) {
        self.lock().upload_position = position;
    }

    pub fn set_url(&self, url: Url) {
        self.lock().url = url;
    }

    pub fn started(&self) -> bool {
        self.lock().started
    }

    pub fn cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn reads_issued(&self) -> usize {
        self.lock().reads_issued
    }

    pub fn followed_redirects(&self) -> Vec<Url> {
        self.lock().followed_redirects.clone()
    }

    pub fn auth_responses(&self) -> Vec<Option<AuthCredentials>> {
        self.lock().auth_responses.clone()
    }

    pub fn ssl_continued(&self) -> bool {
        self.lock().ssl_continued
    }
}

#[derive(Default)]
struct FactoryState {
    created: Vec<(Url, MockTransportHandle)>,
}

/// Factory handed to the dispatcher; creates a [`MockTransport`] per
/// accepted request and records a handle for the test to script.
pub struct MockTransportFactory {
    schemes: Vec<String>,
    state: Arc<Mutex<FactoryState>>,
}

/// Test-side view of every transport the factory created
#[derive(Clone)]
pub struct MockFactoryHandle {
    state: Arc<Mutex<FactoryState>>,
}

impl MockTransportFactory {
    pub fn new() -> (Self, MockFactoryHandle) {
        let state = Arc::new(Mutex::new(FactoryState::default()));
        (
            Self {
                schemes: vec!["http".to_string(), "https".to_string()],
                state: Arc::clone(&state),
            },
            MockFactoryHandle { state },
        )
    }

    pub fn with_schemes(mut self, schemes: &[&str]) -> Self {
        self.schemes = schemes.iter().map(|s| s.to_string()).collect();
        self
    }
}

impl TransportFactory for MockTransportFactory {
    fn handles_scheme(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s == scheme)
    }

    fn create(&mut self, request: TransportRequest) -> Box<dyn Transport> {
        let (transport, handle) = MockTransport::new(request.url.clone());
        self.state
            .lock()
            .unwrap()
            .created
            .push((request.url, handle));
        Box::new(transport)
    }
}

impl MockFactoryHandle {
    /// Handle onto the most recently created transport
    pub fn last(&self) -> Option<MockTransportHandle> {
        self.state
            .lock()
            .unwrap()
            .created
            .last()
            .map(|(_, h)| h.clone())
    }

    /// Handle onto the transport created for `url`
    pub fn transport_for(&self, url: &Url) -> Option<MockTransportHandle> {
        self.state
            .lock()
            .unwrap()
            .created
            .iter()
            .find(|(u, _)| u == url)
            .map(|(_, h)| h.clone())
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_mock_read_sequence() {
        let (mut transport, handle) = MockTransport::new(url("http://example.com/"));
        handle.push_chunk(b"hello".to_vec());
        transport.start();
        assert!(handle.started());

        assert_eq!(transport.read(4096), ReadOutcome::Ready(b"hello".to_vec()));
        assert_eq!(transport.read(4096), ReadOutcome::Eof);
        assert_eq!(handle.reads_issued(), 2);
    }

    #[test]
    fn test_mock_pending_read() {
        let (mut transport, handle) = MockTransport::new(url("http://example.com/"));
        handle.set_eof_after_chunks(false);
        assert_eq!(transport.read(4096), ReadOutcome::Pending);
        assert!(transport.has_pending_io());
    }

    #[test]
    fn test_factory_records_created_transports() {
        let (mut factory, handle) = MockTransportFactory::new();
        assert!(factory.handles_scheme("https"));
        assert!(!factory.handles_scheme("ftp"));

        let _ = factory.create(TransportRequest::new(url("http://a.test/")));
        let _ = factory.create(TransportRequest::new(url("http://b.test/")));
        assert_eq!(handle.created_count(), 2);
        assert!(handle.transport_for(&url("http://a.test/")).is_some());
    }
}
