//! Injected collaborator contracts
//!
//! The original singletons (security policy, safe-browsing service, plugin
//! registry, certificate store) are narrow trait objects handed to the
//! dispatcher at construction so the core stays testable in isolation.
//! Only the methods the pipeline actually consumes are modeled.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use url::Url;

use crate::dispatch::request::GlobalRequestId;

/// Decides whether a client may fetch a URL or upload a file.
#[cfg_attr(test, mockall::automock)]
pub trait SecurityPolicy: Send {
    fn can_request_url(&self, client_id: u32, url: &Url) -> bool;
    fn can_upload_file(&self, client_id: u32, path: &Path) -> bool;
}

/// Policy that allows everything; suitable for embedders without client
/// sandboxing and for tests.
pub struct OpenSecurityPolicy;

impl SecurityPolicy for OpenSecurityPolicy {
    fn can_request_url(&self, _client_id: u32, _url: &Url) -> bool {
        true
    }

    fn can_upload_file(&self, _client_id: u32, _path: &Path) -> bool {
        true
    }
}

/// Synchronous answer from [`SafeBrowsingChecker::check_url`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDisposition {
    /// Known safe; no verdict callback will follow
    Safe,
    /// A verdict will arrive later through `on_url_check_result`
    Pending,
}

/// Final verdict for a pending URL check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlCheckVerdict {
    Safe,
    Malicious,
}

/// Asynchronous URL reputation checker.
pub trait SafeBrowsingChecker: Send + Sync {
    fn enabled(&self) -> bool;

    fn can_check_url(&self, url: &Url) -> bool;

    /// Start a check for `url`. `Pending` means the verdict is delivered
    /// later to the dispatcher tagged with `id`.
    fn check_url(&self, url: &Url, id: GlobalRequestId) -> CheckDisposition;

    /// Abandon a pending check; no verdict may be delivered afterwards.
    fn cancel_check(&self, id: GlobalRequestId);
}

/// Checker that is switched off entirely
pub struct NoSafeBrowsing;

impl SafeBrowsingChecker for NoSafeBrowsing {
    fn enabled(&self) -> bool {
        false
    }

    fn can_check_url(&self, _url: &Url) -> bool {
        false
    }

    fn check_url(&self, _url: &Url, _id: GlobalRequestId) -> CheckDisposition {
        CheckDisposition::Safe
    }

    fn cancel_check(&self, _id: GlobalRequestId) {}
}

/// Answers whether an installed plugin can render a MIME type; consulted
/// by the download-diversion decision.
pub trait PluginRegistry: Send + Sync {
    fn have_plugin_for(&self, mime_type: &str) -> bool;
}

/// Registry with no plugins installed
pub struct NoPlugins;

impl PluginRegistry for NoPlugins {
    fn have_plugin_for(&self, _mime_type: &str) -> bool {
        false
    }
}

/// Stores certificates observed on responses so UI surfaces can look them
/// up by id, and remembers per-certificate override decisions.
pub trait CertStore: Send + Sync {
    /// Store a certificate for a client, returning its id. Storing the
    /// same certificate for the same client returns the existing id.
    fn store(&self, cert_der: &[u8], client_id: u32) -> u32;

    fn retrieve(&self, cert_id: u32) -> Option<Vec<u8>>;

    /// Remember that the user chose to proceed past errors on this
    /// certificate.
    fn remember_decision(&self, cert_id: u32);

    fn is_remembered(&self, cert_id: u32) -> bool;
}

#[derive(Default)]
struct CertStoreState {
    next_id: u32,
    by_id: HashMap<u32, Vec<u8>>,
    by_cert: HashMap<(Vec<u8>, u32), u32>,
    remembered: HashSet<u32>,
}

/// In-process [`CertStore`] implementation
#[derive(Default)]
pub struct InMemoryCertStore {
    inner: Mutex<CertStoreState>,
}

impl InMemoryCertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CertStore for InMemoryCertStore {
    fn store(&self, cert_der: &[u8], client_id: u32) -> u32 {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let key = (cert_der.to_vec(), client_id);
        if let Some(&id) = state.by_cert.get(&key) {
            return id;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.by_id.insert(id, cert_der.to_vec());
        state.by_cert.insert(key, id);
        id
    }

    fn retrieve(&self, cert_id: u32) -> Option<Vec<u8>> {
        let state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.by_id.get(&cert_id).cloned()
    }

    fn remember_decision(&self, cert_id: u32) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.remembered.insert(cert_id);
    }

    fn is_remembered(&self, cert_id: u32) -> bool {
        let state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.remembered.contains(&cert_id)
    }
}
