//! End-to-end dispatcher scenarios driven through a scripted transport.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use url::Url;

use resource_host::dispatch::request::LoadFlags;
use resource_host::handler::download::MAX_QUEUED_DOWNLOAD_CHUNKS;
use resource_host::policy::{
    CheckDisposition, InMemoryCertStore, SafeBrowsingChecker, UrlCheckVerdict,
};
use resource_host::transport::mock::{MockFactoryHandle, MockTransportFactory};
use resource_host::transport::{AuthChallenge, AuthCredentials, ResponseHead, SslInfo, UploadElement};
use resource_host::{
    ClientMessage, ClientSender, DispatchError, GlobalRequestId, RequestDescriptor,
    ResourceDispatcher, ResourceKind,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn setup() -> (
    ResourceDispatcher,
    Receiver<ClientMessage>,
    MockFactoryHandle,
) {
    init_logging();
    let (client, rx) = ClientSender::channel();
    let (factory, transports) = MockTransportFactory::new();
    (
        ResourceDispatcher::new(client, Box::new(factory)),
        rx,
        transports,
    )
}

fn head(mime: &str) -> ResponseHead {
    let mut head = ResponseHead::default();
    head.mime_type = mime.to_string();
    head
}

fn drain(rx: &Receiver<ClientMessage>) -> Vec<ClientMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn data_received_count(messages: &[ClientMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, ClientMessage::DataReceived { .. }))
        .count()
}

#[test]
fn test_redirect_precedes_response() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    transport.set_url(url("http://b.test/"));
    dispatcher.on_transport_redirect(id, url("http://b.test/"));
    transport.set_response(head("text/html"));
    transport.push_chunk(b"<html></html>".to_vec());
    dispatcher.on_transport_response_started(id);

    let messages = drain(&rx);
    assert!(matches!(
        messages[0],
        ClientMessage::ReceivedRedirect { ref new_url, .. } if *new_url == url("http://b.test/")
    ));
    assert!(matches!(messages[1], ClientMessage::ReceivedResponse { .. }));
    assert!(matches!(messages[2], ClientMessage::DataReceived { .. }));
    assert!(matches!(
        messages[3],
        ClientMessage::RequestComplete { status: Ok(()), .. }
    ));
}

#[test]
fn test_pause_parks_chunk_until_resume() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    transport.set_response(head("text/html"));
    transport.set_eof_after_chunks(false);
    dispatcher.on_transport_response_started(id);
    drain(&rx);

    dispatcher.pause(id, true);
    dispatcher.on_transport_read_completed(id, b"parked".to_vec());
    assert_eq!(data_received_count(&drain(&rx)), 0);

    dispatcher.pause(id, false);
    let messages = drain(&rx);
    assert_eq!(data_received_count(&messages), 1);
    match &messages[0] {
        ClientMessage::DataReceived { data, .. } => assert_eq!(data.as_slice(), b"parked"),
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn test_nested_pauses_resume_once_balanced() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();
    transport.set_response(head("text/html"));
    transport.set_eof_after_chunks(false);
    dispatcher.on_transport_response_started(id);
    drain(&rx);

    dispatcher.pause(id, true);
    dispatcher.pause(id, true);
    dispatcher.on_transport_read_completed(id, b"x".to_vec());

    dispatcher.pause(id, false);
    assert_eq!(data_received_count(&drain(&rx)), 0);
    dispatcher.pause(id, false);
    assert_eq!(data_received_count(&drain(&rx)), 1);
}

#[test]
fn test_backpressure_pauses_and_acks_release() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    transport.set_response(head("text/html"));
    for i in 0..25 {
        transport.push_chunk(format!("chunk-{i}").into_bytes());
    }
    dispatcher.on_transport_response_started(id);

    // Delivery stops once 21 data messages are unacked.
    let delivered = data_received_count(&drain(&rx));
    assert_eq!(delivered, 21);

    // Each ack retires two messages of backlog, letting two more through.
    dispatcher.ack_data(id);
    assert_eq!(data_received_count(&drain(&rx)), 2);
    dispatcher.ack_data(id);
    assert_eq!(data_received_count(&drain(&rx)), 2);

    // Final ack lets the stream finish.
    dispatcher.ack_data(id);
    let messages = drain(&rx);
    assert_eq!(data_received_count(&messages), 0);
    assert!(matches!(
        messages.last(),
        Some(ClientMessage::RequestComplete { status: Ok(()), .. })
    ));
    assert_eq!(dispatcher.pending_request_count(), 0);
}

#[test]
fn test_sync_load_single_reply() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/data")).sync_load();
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    transport.set_response(head("application/json"));
    transport.push_chunk(b"{\"a\":".to_vec());
    transport.push_chunk(b"1}".to_vec());
    dispatcher.on_transport_response_started(id);

    let messages = drain(&rx);
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        ClientMessage::SyncLoadResult { status, response, data, .. } => {
            assert!(status.is_ok());
            assert_eq!(response.mime_type, "application/json");
            assert_eq!(data.as_slice(), b"{\"a\":1}");
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn test_cross_site_response_held_for_unload_ack() {
    let (mut dispatcher, rx, transports) = setup();
    dispatcher.set_cross_site_pending(1, 10, true);
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://b.test/"))
        .with_kind(ResourceKind::MainFrame);
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    transport.set_response(head("text/html"));
    transport.push_chunk(b"<html>new site</html>".to_vec());
    dispatcher.on_transport_response_started(id);

    // Only the handoff notification went out; the response is parked.
    let messages = drain(&rx);
    assert_eq!(messages.len(), 1);
    assert!(matches!(
        messages[0],
        ClientMessage::CrossSiteResponseReady { client_id: 1, view_id: 10, .. }
    ));

    dispatcher.on_close_page_ack(id);
    let messages = drain(&rx);
    assert!(matches!(messages[0], ClientMessage::ReceivedResponse { .. }));
    assert_eq!(data_received_count(&messages), 1);
    assert!(matches!(
        messages.last(),
        Some(ClientMessage::RequestComplete { status: Ok(()), .. })
    ));
}

#[test]
fn test_cross_site_attachment_diverted_without_handoff() {
    let (mut dispatcher, rx, transports) = setup();
    dispatcher.set_cross_site_pending(1, 10, true);
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://b.test/export"))
        .with_kind(ResourceKind::MainFrame);
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    let mut h = head("text/html");
    h.content_disposition = "attachment; filename=export.html".to_string();
    transport.set_response(h);
    transport.push_chunk(b"payload".to_vec());
    dispatcher.on_transport_response_started(id);

    // The navigation never commits: no unload handoff, the page consumer
    // hears its load is over and the body goes to the download instead.
    let messages = drain(&rx);
    assert!(!messages
        .iter()
        .any(|m| matches!(m, ClientMessage::CrossSiteResponseReady { .. })));
    assert!(messages.iter().any(|m| matches!(
        m,
        ClientMessage::RequestComplete { status: Err(DispatchError::Aborted), .. }
    )));
    let download_id = messages
        .iter()
        .find_map(|m| match m {
            ClientMessage::DownloadStarted { info } => Some(info.download_id),
            _ => None,
        })
        .expect("download announced");

    dispatcher.on_download_file_ready(download_id);
    assert!(drain(&rx).iter().any(|m| matches!(
        m,
        ClientMessage::DownloadCompleted { status: Ok(()), .. }
    )));
    assert_eq!(dispatcher.pending_request_count(), 0);
}

#[test]
fn test_blocked_view_handoff_order_and_cancel() {
    let (mut dispatcher, rx, transports) = setup();
    dispatcher.block_requests_for_view(1, 10);
    dispatcher
        .begin(RequestDescriptor::new(1, 10, 1, url("http://a.test/")))
        .unwrap();
    dispatcher
        .begin(RequestDescriptor::new(1, 10, 2, url("http://b.test/")))
        .unwrap();
    assert_eq!(transports.created_count(), 0);

    dispatcher.resume_blocked_requests_for_view(1, 10);
    assert_eq!(transports.created_count(), 2);
    assert!(transports.transport_for(&url("http://a.test/")).is_some());

    // A second round that gets cancelled completes everything as aborted.
    dispatcher.block_requests_for_view(1, 10);
    dispatcher
        .begin(RequestDescriptor::new(1, 10, 3, url("http://c.test/")))
        .unwrap();
    dispatcher.cancel_blocked_requests_for_view(1, 10);
    let messages = drain(&rx);
    assert!(messages.iter().any(|m| matches!(
        m,
        ClientMessage::RequestComplete { id, status: Err(DispatchError::Aborted) }
            if *id == GlobalRequestId::new(1, 3)
    )));
    assert_eq!(transports.created_count(), 2);
}

#[test]
fn test_pdf_frame_load_becomes_download() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/report.pdf"))
        .with_kind(ResourceKind::MainFrame);
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    transport.set_response(head("application/pdf"));
    transport.push_chunk(b"%PDF-1.7 payload".to_vec());
    dispatcher.on_transport_response_started(id);

    let messages = drain(&rx);
    // The page consumer is told its load is over.
    assert!(messages.iter().any(|m| matches!(
        m,
        ClientMessage::RequestComplete { status: Err(DispatchError::Aborted), .. }
    )));
    let download_id = messages
        .iter()
        .find_map(|m| match m {
            ClientMessage::DownloadStarted { info } => Some(info.download_id),
            _ => None,
        })
        .expect("download announced");

    // Reads hold until the embedder acks file creation.
    assert_eq!(dispatcher.pending_request_count(), 1);
    dispatcher.on_download_file_ready(download_id);

    let messages = drain(&rx);
    assert!(messages.iter().any(|m| matches!(
        m,
        ClientMessage::DownloadCompleted { status: Ok(()), .. }
    )));
    assert_eq!(dispatcher.pending_request_count(), 0);
}

#[test]
fn test_download_survives_client_cancel() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/file.pdf"))
        .with_kind(ResourceKind::MainFrame);
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    transport.set_response(head("application/pdf"));
    transport.set_eof_after_chunks(false);
    transport.push_chunk(b"%PDF-".to_vec());
    dispatcher.on_transport_response_started(id);
    drain(&rx);

    // Neither a direct client cancel nor a client teardown touches it.
    dispatcher.cancel(id, true);
    assert_eq!(dispatcher.pending_request_count(), 1);
    dispatcher.cancel_all_for_client(1);
    assert_eq!(dispatcher.pending_request_count(), 1);
    assert!(!transport.cancelled());
}

#[test]
fn test_download_fetch_protected_before_response() {
    let (mut dispatcher, rx, transports) = setup();
    let id = dispatcher
        .begin_download(1, 10, url("http://a.test/big.bin"))
        .unwrap();
    let transport = transports.last().unwrap();

    // The fetch is browser-owned from the start; client cancels and client
    // teardown must not reach it even before any response arrives.
    dispatcher.cancel(id, true);
    dispatcher.cancel_all_for_client(1);
    assert_eq!(dispatcher.pending_request_count(), 1);
    assert!(!transport.cancelled());

    let mut h = head("application/octet-stream");
    h.content_length = 4;
    transport.set_response(h);
    transport.push_chunk(b"data".to_vec());
    dispatcher.on_transport_response_started(id);
    assert!(drain(&rx)
        .iter()
        .any(|m| matches!(m, ClientMessage::DownloadStarted { .. })));
}

#[test]
fn test_explicit_download_fetch() {
    let (mut dispatcher, rx, transports) = setup();
    let id = dispatcher
        .begin_download(1, 10, url("http://a.test/big.bin"))
        .unwrap();
    let transport = transports.last().unwrap();

    let mut h = head("application/octet-stream");
    h.content_length = 4;
    transport.set_response(h);
    transport.push_chunk(b"data".to_vec());
    dispatcher.on_transport_response_started(id);

    let messages = drain(&rx);
    let download_id = messages
        .iter()
        .find_map(|m| match m {
            ClientMessage::DownloadStarted { info } => {
                assert_eq!(info.content_length, 4);
                Some(info.download_id)
            }
            _ => None,
        })
        .expect("download announced");
    dispatcher.on_download_file_ready(download_id);
    assert!(drain(&rx).iter().any(|m| matches!(
        m,
        ClientMessage::DownloadCompleted { status: Ok(()), .. }
    )));
}

#[test]
fn test_download_write_backpressure() {
    let (mut dispatcher, rx, transports) = setup();
    let id = dispatcher
        .begin_download(1, 10, url("http://a.test/big.bin"))
        .unwrap();
    let transport = transports.last().unwrap();
    transport.set_response(head("application/octet-stream"));
    transport.set_eof_after_chunks(false);
    dispatcher.on_transport_response_started(id);
    let download_id = drain(&rx)
        .iter()
        .find_map(|m| match m {
            ClientMessage::DownloadStarted { info } => Some(info.download_id),
            _ => None,
        })
        .expect("download announced");
    dispatcher.on_download_file_ready(download_id);

    // Pile up more chunks than the file writer threshold without draining.
    for i in 0..(MAX_QUEUED_DOWNLOAD_CHUNKS + 10) {
        dispatcher.on_transport_read_completed(id, format!("chunk-{i}").into_bytes());
    }
    dispatcher.tick(Instant::now());

    // The write-side pause parks the next chunk instead of delivering it;
    // an unpaused delivery would issue a follow-up read.
    let reads_before = transport.reads_issued();
    dispatcher.on_transport_read_completed(id, b"overflow".to_vec());
    assert_eq!(transport.reads_issued(), reads_before);
}

#[test]
fn test_auth_challenge_roundtrip() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("https://a.test/secret"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    let challenge = AuthChallenge {
        host: "a.test".to_string(),
        realm: "private".to_string(),
        is_proxy: false,
    };
    dispatcher.on_auth_required(id, challenge.clone());
    match drain(&rx).pop() {
        Some(ClientMessage::AuthNeeded { challenge: got, .. }) => assert_eq!(got, challenge),
        other => panic!("unexpected message: {:?}", other),
    }

    dispatcher.resolve_auth(
        id,
        Some(AuthCredentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        }),
    );
    assert_eq!(transport.auth_responses().len(), 1);
}

#[test]
fn test_cancel_with_pending_auth_dismisses_prompt() {
    let (mut dispatcher, rx, _transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("https://a.test/secret"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    dispatcher.on_auth_required(
        id,
        AuthChallenge {
            host: "a.test".to_string(),
            realm: "private".to_string(),
            is_proxy: false,
        },
    );
    drain(&rx);

    dispatcher.cancel(id, false);
    let messages = drain(&rx);
    assert!(matches!(
        messages[0],
        ClientMessage::AuthPromptCancelled { .. }
    ));
    // Abandoned at the prompt: the load failed for want of credentials.
    assert!(matches!(
        messages[1],
        ClientMessage::RequestComplete { status: Err(DispatchError::AuthRequired), .. }
    ));
    assert_eq!(dispatcher.pending_request_count(), 0);
}

#[test]
fn test_ssl_error_remembered_decision() {
    init_logging();
    let (client, rx) = ClientSender::channel();
    let (factory, transports) = MockTransportFactory::new();
    let mut dispatcher = ResourceDispatcher::new(client, Box::new(factory))
        .with_cert_store(Arc::new(InMemoryCertStore::new()));

    let ssl = SslInfo {
        cert_der: b"cert-bytes".to_vec(),
        cert_status: 0,
        security_bits: 256,
    };

    let first = RequestDescriptor::new(1, 10, 1, url("https://bad.test/"));
    let first_id = first.id();
    dispatcher.begin(first).unwrap();
    let transport = transports.last().unwrap();
    transport.set_ssl_info(ssl.clone());

    dispatcher.on_ssl_certificate_error(first_id, -200);
    let messages = drain(&rx);
    let cert_id = match &messages[0] {
        ClientMessage::SslCertificateError { error, cert_id, .. } => {
            assert_eq!(*error, -200);
            *cert_id
        }
        other => panic!("unexpected message: {:?}", other),
    };
    assert_ne!(cert_id, 0);

    dispatcher.resolve_ssl_error(first_id, true, true);
    assert!(transport.ssl_continued());

    // The same certificate on a later request proceeds silently.
    let second = RequestDescriptor::new(1, 10, 2, url("https://bad.test/again"));
    let second_id = second.id();
    dispatcher.begin(second).unwrap();
    let transport2 = transports.last().unwrap();
    transport2.set_ssl_info(ssl);
    dispatcher.on_ssl_certificate_error(second_id, -200);

    assert!(transport2.ssl_continued());
    assert!(drain(&rx).is_empty());
}

#[test]
fn test_ssl_error_denied_completes_with_error() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("https://bad.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    transports.last().unwrap().set_ssl_info(SslInfo {
        cert_der: b"cert".to_vec(),
        cert_status: 0,
        security_bits: 256,
    });

    dispatcher.on_ssl_certificate_error(id, -201);
    drain(&rx);
    dispatcher.resolve_ssl_error(id, false, false);

    let messages = drain(&rx);
    assert!(matches!(
        messages[0],
        ClientMessage::RequestComplete { status: Err(DispatchError::SslError(-201)), .. }
    ));
    assert_eq!(dispatcher.pending_request_count(), 0);
}

struct PendingChecker {
    cancelled: Mutex<Vec<GlobalRequestId>>,
}

impl SafeBrowsingChecker for PendingChecker {
    fn enabled(&self) -> bool {
        true
    }

    fn can_check_url(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    fn check_url(&self, _url: &Url, _id: GlobalRequestId) -> CheckDisposition {
        CheckDisposition::Pending
    }

    fn cancel_check(&self, id: GlobalRequestId) {
        self.cancelled.lock().unwrap().push(id);
    }
}

fn setup_with_checker() -> (
    ResourceDispatcher,
    Receiver<ClientMessage>,
    MockFactoryHandle,
    Arc<PendingChecker>,
) {
    init_logging();
    let checker = Arc::new(PendingChecker {
        cancelled: Mutex::new(Vec::new()),
    });
    let (client, rx) = ClientSender::channel();
    let (factory, transports) = MockTransportFactory::new();
    let dispatcher = ResourceDispatcher::new(client, Box::new(factory))
        .with_safe_browsing(Arc::clone(&checker) as Arc<dyn SafeBrowsingChecker>);
    (dispatcher, rx, transports, checker)
}

#[test]
fn test_reputation_check_holds_start_until_safe() {
    let (mut dispatcher, rx, transports, _checker) = setup_with_checker();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://slow.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();

    let transport = transports.last().unwrap();
    assert!(!transport.started());

    dispatcher.on_url_check_result(id, UrlCheckVerdict::Safe);
    assert!(transport.started());

    transport.set_response(head("text/html"));
    transport.push_chunk(b"<html></html>".to_vec());
    dispatcher.on_transport_response_started(id);
    assert!(matches!(
        drain(&rx).last(),
        Some(ClientMessage::RequestComplete { status: Ok(()), .. })
    ));
}

#[test]
fn test_malicious_verdict_aborts() {
    let (mut dispatcher, rx, transports, _checker) = setup_with_checker();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://evil.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();

    dispatcher.on_url_check_result(id, UrlCheckVerdict::Malicious);
    assert!(!transports.last().unwrap().started());
    assert!(matches!(
        drain(&rx).last(),
        Some(ClientMessage::RequestComplete { status: Err(DispatchError::Aborted), .. })
    ));
    assert_eq!(dispatcher.pending_request_count(), 0);
}

#[test]
fn test_stale_reputation_check_times_out_as_safe() {
    let (mut dispatcher, _rx, transports, checker) = setup_with_checker();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://slow.test/"));
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();
    assert!(!transport.started());

    dispatcher.tick(Instant::now() + Duration::from_secs(2));
    assert!(transport.started());
    assert_eq!(checker.cancelled.lock().unwrap().len(), 1);
}

#[test]
fn test_completion_cancels_inflight_check() {
    let (mut dispatcher, _rx, _transports, checker) = setup_with_checker();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://slow.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();

    dispatcher.cancel(id, false);
    assert_eq!(dispatcher.pending_request_count(), 0);
    assert!(!checker.cancelled.lock().unwrap().is_empty());
}

#[test]
fn test_upload_progress_throttling() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/post"))
        .with_method("POST")
        .with_upload(vec![UploadElement::Bytes(vec![0u8; 1000])])
        .with_load_flags(LoadFlags {
            cache_only: false,
            report_upload_progress: true,
        });
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    let start = Instant::now();
    transport.set_upload_position(500);
    dispatcher.tick(start);
    match drain(&rx).pop() {
        Some(ClientMessage::UploadProgress { position, size, .. }) => {
            assert_eq!(position, 500);
            assert_eq!(size, 1000);
        }
        other => panic!("unexpected message: {:?}", other),
    }

    // Unacked: further progress is withheld.
    transport.set_upload_position(505);
    dispatcher.tick(start);
    assert!(drain(&rx).is_empty());

    // Acked but only a tiny delta and no time passed: still withheld.
    dispatcher.ack_upload_progress(id);
    dispatcher.tick(start);
    assert!(drain(&rx).is_empty());

    // Enough silence forces a report.
    dispatcher.tick(start + Duration::from_secs(2));
    assert!(matches!(
        drain(&rx).pop(),
        Some(ClientMessage::UploadProgress { position: 505, .. })
    ));

    // Completion of the upload always reports once acked.
    dispatcher.ack_upload_progress(id);
    transport.set_upload_position(1000);
    dispatcher.tick(start + Duration::from_secs(2));
    assert!(matches!(
        drain(&rx).pop(),
        Some(ClientMessage::UploadProgress { position: 1000, .. })
    ));
}

#[test]
fn test_save_file_fetch_streams_cached_body() {
    let (mut dispatcher, rx, transports) = setup();
    let id = dispatcher
        .begin_save_file(1, 10, url("http://a.test/page.html"))
        .unwrap();
    let transport = transports.last().unwrap();

    transport.set_response(head("text/html"));
    transport.push_chunk(b"<html>cached</html>".to_vec());
    dispatcher.on_transport_response_started(id);

    let messages = drain(&rx);
    assert!(matches!(messages[0], ClientMessage::SaveFileData { .. }));
    assert!(matches!(
        messages[1],
        ClientMessage::SaveFileComplete { status: Ok(()), .. }
    ));
}

#[test]
fn test_completion_delivered_exactly_once() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();
    transport.set_response(head("text/html"));
    transport.push_chunk(b"body".to_vec());
    dispatcher.on_transport_response_started(id);

    // Late cancels and acks for the finished request are no-ops.
    dispatcher.cancel(id, false);
    dispatcher.ack_data(id);
    dispatcher.on_transport_read_completed(id, b"late".to_vec());

    let completions = drain(&rx)
        .iter()
        .filter(|m| matches!(m, ClientMessage::RequestComplete { .. }))
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn test_tick_loop_stops_on_shutdown() {
    init_logging();
    let (client, _rx) = ClientSender::channel();
    let (factory, _transports) = MockTransportFactory::new();
    let dispatcher = Arc::new(Mutex::new(ResourceDispatcher::new(
        client,
        Box::new(factory),
    )));

    let task = tokio::spawn(resource_host::run_tick_loop(Arc::clone(&dispatcher)));
    dispatcher.lock().unwrap().shutdown();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("tick loop should stop after shutdown")
        .unwrap();
}

#[test]
fn test_transport_failure_surfaces_error_code() {
    let (mut dispatcher, rx, transports) = setup();
    let descriptor = RequestDescriptor::new(1, 10, 1, url("http://a.test/"));
    let id = descriptor.id();
    dispatcher.begin(descriptor).unwrap();
    let transport = transports.last().unwrap();

    transport.set_status(resource_host::transport::TransportStatus::Failed(-105));
    dispatcher.on_transport_failed(id);

    assert!(matches!(
        drain(&rx).last(),
        Some(ClientMessage::RequestComplete {
            status: Err(DispatchError::TransportError(-105)),
            ..
        })
    ));
    assert_eq!(dispatcher.pending_request_count(), 0);
}
