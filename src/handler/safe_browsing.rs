//! URL reputation gate

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use url::Url;

use crate::dispatch::request::GlobalRequestId;
use crate::handler::{Decision, ResourceHandler};
use crate::policy::{CheckDisposition, SafeBrowsingChecker, UrlCheckVerdict};
use crate::transport::ResponseHead;
use crate::utils::CompletionStatus;

/// A pending check older than this resolves as safe. Reputation lookups
/// must never wedge a navigation.
pub const URL_CHECK_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Default)]
struct UrlCheckState {
    verdict: Option<UrlCheckVerdict>,
    in_flight: bool,
    started_at: Option<Instant>,
}

/// Shared view of one request's pending URL check.
///
/// The handler and the dispatcher both hold a clone: the handler starts
/// checks and consumes verdicts on replay; the dispatcher records verdicts
/// as they arrive and times out stale checks.
#[derive(Clone, Default)]
pub struct UrlCheckHandle {
    inner: Arc<Mutex<UrlCheckState>>,
}

impl UrlCheckHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, UrlCheckState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin(&self) {
        let mut state = self.lock();
        state.in_flight = true;
        state.started_at = Some(Instant::now());
        state.verdict = None;
    }

    /// Record the verdict for a pending check
    pub fn resolve(&self, verdict: UrlCheckVerdict) {
        let mut state = self.lock();
        state.verdict = Some(verdict);
        state.in_flight = false;
    }

    /// Abandon the check without a verdict
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.in_flight = false;
        state.started_at = None;
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    /// Whether the pending check has outlived the deadline
    pub fn timed_out(&self, now: Instant) -> bool {
        let state = self.lock();
        state.in_flight
            && state
                .started_at
                .is_some_and(|start| now.duration_since(start) >= URL_CHECK_TIMEOUT)
    }

    fn take_verdict(&self) -> Option<UrlCheckVerdict> {
        self.lock().verdict.take()
    }
}

/// Holds request starts and redirects until the URL's reputation is known.
///
/// A malicious verdict never reaches this handler as a replay; the
/// dispatcher aborts the request directly. Completions always flow through
/// so a transport failure cannot be swallowed by a pending check.
pub struct SafeBrowsingHandler {
    inner: Box<dyn ResourceHandler>,
    checker: Arc<dyn SafeBrowsingChecker>,
    handle: UrlCheckHandle,
}

impl SafeBrowsingHandler {
    pub fn new(inner: Box<dyn ResourceHandler>, checker: Arc<dyn SafeBrowsingChecker>) -> Self {
        Self {
            inner,
            checker,
            handle: UrlCheckHandle::new(),
        }
    }

    /// The dispatcher keeps a clone to resolve and time out checks
    pub fn check_handle(&self) -> UrlCheckHandle {
        self.handle.clone()
    }

    /// Returns true when the event may proceed; false parks it until the
    /// verdict arrives.
    fn clear_url(&mut self, id: GlobalRequestId, url: &Url) -> bool {
        // A replay consumes the verdict recorded by the dispatcher.
        if let Some(verdict) = self.handle.take_verdict() {
            debug_assert_eq!(verdict, UrlCheckVerdict::Safe);
            return true;
        }
        if !self.checker.can_check_url(url) {
            return true;
        }
        match self.checker.check_url(url, id) {
            CheckDisposition::Safe => true,
            CheckDisposition::Pending => {
                log::debug!("holding request {} for reputation check of {}", id, url);
                self.handle.begin();
                false
            }
        }
    }
}

impl ResourceHandler for SafeBrowsingHandler {
    fn on_will_start(&mut self, id: GlobalRequestId, url: &Url) -> Decision {
        if !self.clear_url(id, url) {
            return Decision::Defer;
        }
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
        // Every redirect target is vetted like the original URL.
        if !self.clear_url(id, new_url) {
            return Decision::Defer;
        }
        self.inner.on_request_redirected(id, new_url, response)
    }

    fn on_response_started(&mut self, id: GlobalRequestId, response: &ResponseHead) -> Decision {
        self.inner.on_response_started(id, response)
    }

    fn on_will_read(&mut self, id: GlobalRequestId) -> Decision {
        self.inner.on_will_read(id)
    }

    fn on_read_completed(&mut self, id: GlobalRequestId, data: &[u8]) -> Decision {
        self.inner.on_read_completed(id, data)
    }

    fn on_response_completed(
        &mut self,
        id: GlobalRequestId,
        status: &CompletionStatus,
    ) -> Decision {
        if self.handle.is_in_flight() {
            self.checker.cancel_check(id);
            self.handle.cancel();
        }
        self.inner.on_response_completed(id, status)
    }

    fn on_response_taken_over(&mut self, id: GlobalRequestId, status: &CompletionStatus) {
        if self.handle.is_in_flight() {
            self.checker.cancel_check(id);
            self.handle.cancel();
        }
        self.inner.on_response_taken_over(id, status);
    }
}
