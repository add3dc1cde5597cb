//! End-to-end fetch scenarios against a local mock HTTP server: parallel
//! ranged transfers, hash verification, range refusal, resume, server
//! backoff, and mirror selection.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use snag_core::assembly::{meta_path, partial_path, PartialMeta};
use snag_core::events::EventSink;
use snag_core::request::{FetchOutcome, FetchRequest, OutputTarget};
use snag_core::{Fetcher, NullSink, Validators};

const ETAG: &str = "\"v1\"";

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn body_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn parse_range(raw: &str) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Serves a fixed body with range support, an ETag, and optional vices:
/// refusing ranges outright, ignoring them with a 200, or answering the
/// first data range with a 429.
struct RangeServer {
    data: Vec<u8>,
    reject_ranges: bool,
    ignore_data_ranges: bool,
    /// Answer data ranges with 403 (probe ranges still succeed).
    forbid_data_ranges: bool,
    backoff_once: Option<Arc<AtomicBool>>,
}

impl RangeServer {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            reject_ranges: false,
            ignore_data_ranges: false,
            forbid_data_ranges: false,
            backoff_once: None,
        }
    }
}

impl Respond for RangeServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.data.len();
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) if !self.reject_ranges => {
                let is_probe = start == 0 && end == 0;
                if !is_probe {
                    if self.forbid_data_ranges {
                        return ResponseTemplate::new(403);
                    }
                    if let Some(flag) = &self.backoff_once {
                        if !flag.swap(true, Ordering::SeqCst) {
                            return ResponseTemplate::new(429).insert_header("Retry-After", "1");
                        }
                    }
                    if self.ignore_data_ranges {
                        return ResponseTemplate::new(200)
                            .insert_header("Accept-Ranges", "bytes")
                            .insert_header("ETag", ETAG)
                            .set_body_bytes(self.data.clone());
                    }
                }
                let end = (end as usize).min(total.saturating_sub(1));
                let slice = self.data[start as usize..=end].to_vec();
                ResponseTemplate::new(206)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("ETag", ETAG)
                    .insert_header(
                        "Content-Range",
                        format!("bytes {start}-{end}/{total}").as_str(),
                    )
                    .set_body_bytes(slice)
            }
            _ => {
                let mut resp = ResponseTemplate::new(200)
                    .insert_header("ETag", ETAG)
                    .set_body_bytes(self.data.clone());
                if !self.reject_ranges {
                    resp = resp.insert_header("Accept-Ranges", "bytes");
                }
                resp
            }
        }
    }
}

async fn mount_file(server: &MockServer, responder: RangeServer, advertise_ranges: bool) {
    let mut head = ResponseTemplate::new(200).insert_header("ETag", ETAG);
    if advertise_ranges {
        head = head.insert_header("Accept-Ranges", "bytes");
    }
    Mock::given(method("HEAD"))
        .and(path("/file.bin"))
        .respond_with(head)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(responder)
        .mount(server)
        .await;
}

/// Collects concurrency and retry events for assertions.
#[derive(Default)]
struct RecordingSink {
    concurrency: Mutex<Vec<(usize, String)>>,
    retries: Mutex<Vec<(String, Duration, u32)>>,
}

impl EventSink for RecordingSink {
    fn on_concurrency_changed(&self, n: usize, reason: &'static str) {
        self.concurrency.lock().unwrap().push((n, reason.to_string()));
    }

    fn on_retry(&self, category: &'static str, delay: Duration, attempt: u32) {
        self.retries
            .lock()
            .unwrap()
            .push((category.to_string(), delay, attempt));
    }
}

fn file_request(url: &str, out: &Path) -> FetchRequest {
    let mut request = FetchRequest::new(url, OutputTarget::File(out.to_path_buf()));
    request.max_connections = 8;
    request
}

async fn data_range_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| {
            r.method.as_str() == "GET"
                && r.headers
                    .get("range")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v != "bytes=0-0")
                    .unwrap_or(false)
        })
        .count()
}

#[tokio::test]
async fn test_parallel_fetch_with_matching_hash() {
    let data = body_of(1024 * 1024);
    let expected = sha256_hex(&data);
    let server = MockServer::start().await;
    mount_file(&server, RangeServer::new(data.clone()), true).await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.bin");
    let url = format!("{}/file.bin", server.uri());
    let mut request = file_request(&url, &out);
    request.expected_sha256 = Some(expected.clone());

    let (fetcher, _cancel) = Fetcher::new(Arc::new(NullSink));
    let outcome = fetcher.run(request).await;
    let summary = match outcome {
        FetchOutcome::Success(s) => s,
        FetchOutcome::Failure(f) => panic!("fetch failed: {} ({:?})", f.message, f.kind),
    };

    assert_eq!(summary.bytes, data.len() as u64);
    assert_eq!(summary.sha256, expected);
    assert!(summary.connections_used <= 8);
    assert_eq!(std::fs::read(&out).unwrap(), data);
    assert!(!partial_path(&out).exists());
    assert!(!meta_path(&out).exists());

    // Test range plus at least one data range.
    let ranged = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.headers.contains_key("range"))
        .count();
    assert!(ranged >= 2, "expected at least 2 ranged requests, saw {ranged}");
}

#[tokio::test]
async fn test_wrong_hash_removes_partial_and_target() {
    let data = body_of(512 * 1024);
    let server = MockServer::start().await;
    mount_file(&server, RangeServer::new(data), true).await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.bin");
    let url = format!("{}/file.bin", server.uri());
    let mut request = file_request(&url, &out);
    request.expected_sha256 = Some(sha256_hex(b"something else entirely"));

    let (fetcher, _cancel) = Fetcher::new(Arc::new(NullSink));
    let outcome = fetcher.run(request).await;
    match outcome {
        FetchOutcome::Failure(f) => {
            assert_eq!(f.kind, snag_core::FetchErrorKind::IntegrityMismatch);
            assert_eq!(f.partial_bytes, 0);
            assert!(!f.can_resume);
        }
        FetchOutcome::Success(_) => panic!("wrong hash must fail the fetch"),
    }
    assert!(!out.exists());
    assert!(!partial_path(&out).exists());
    assert!(!meta_path(&out).exists());
}

#[tokio::test]
async fn test_no_range_support_degrades_to_single() {
    let data = body_of(700 * 1024);
    let server = MockServer::start().await;
    let mut responder = RangeServer::new(data.clone());
    responder.reject_ranges = true;
    mount_file(&server, responder, false).await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.bin");
    let url = format!("{}/file.bin", server.uri());

    let (fetcher, _cancel) = Fetcher::new(Arc::new(NullSink));
    let outcome = fetcher.run(file_request(&url, &out)).await;
    let summary = match outcome {
        FetchOutcome::Success(s) => s,
        FetchOutcome::Failure(f) => panic!("fetch failed: {}", f.message),
    };
    assert_eq!(summary.connections_used, 1);
    assert_eq!(std::fs::read(&out).unwrap(), data);
    assert_eq!(data_range_requests(&server).await, 0);
}

#[tokio::test]
async fn test_range_ignored_midway_replans_single() {
    // Advertises ranges and honors the probe, then ignores data ranges.
    let data = body_of(900 * 1024);
    let server = MockServer::start().await;
    let mut responder = RangeServer::new(data.clone());
    responder.ignore_data_ranges = true;
    mount_file(&server, responder, true).await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.bin");
    let url = format!("{}/file.bin", server.uri());

    let (fetcher, _cancel) = Fetcher::new(Arc::new(NullSink));
    let outcome = fetcher.run(file_request(&url, &out)).await;
    match outcome {
        FetchOutcome::Success(_) => {}
        FetchOutcome::Failure(f) => panic!("fetch failed: {}", f.message),
    }
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[tokio::test]
async fn test_fatal_status_midway_fails_without_replan() {
    // The probe proves ranges, then data ranges start coming back 403,
    // as with a presigned URL expiring partway through. That must fail
    // the fetch outright rather than burn a from-zero single-stream
    // re-attempt.
    let data = body_of(900 * 1024);
    let server = MockServer::start().await;
    let mut responder = RangeServer::new(data.clone());
    responder.forbid_data_ranges = true;
    mount_file(&server, responder, true).await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.bin");
    let url = format!("{}/file.bin", server.uri());

    let (fetcher, _cancel) = Fetcher::new(Arc::new(NullSink));
    let outcome = fetcher.run(file_request(&url, &out)).await;
    match outcome {
        FetchOutcome::Failure(f) => {
            assert_eq!(f.kind, snag_core::FetchErrorKind::ProtocolDegraded);
            assert!(f.message.contains("403"), "message: {}", f.message);
        }
        FetchOutcome::Success(_) => panic!("403 on data ranges must fail the fetch"),
    }
    assert!(!out.exists());

    // No single-stream fallback: every GET carried a Range header.
    let unranged_gets = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "GET" && !r.headers.contains_key("range"))
        .count();
    assert_eq!(unranged_gets, 0, "fatal 4xx must not trigger a replan");
}

#[tokio::test]
async fn test_resume_continues_from_recorded_progress() {
    let data = body_of(1024 * 1024);
    let half = data.len() as u64 / 2;
    let server = MockServer::start().await;
    mount_file(&server, RangeServer::new(data.clone()), true).await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.bin");
    let url = format!("{}/file.bin", server.uri());

    // Fake an interrupted run: half the bytes landed, sidecar records it.
    let mut partial = data.clone();
    for byte in partial.iter_mut().skip(half as usize) {
        *byte = 0;
    }
    std::fs::write(partial_path(&out), &partial).unwrap();
    let validators = Validators {
        etag: Some(ETAG.to_string()),
        last_modified: None,
    };
    PartialMeta::new(&url, data.len() as u64, half, &validators)
        .store(&out)
        .unwrap();

    let mut request = file_request(&url, &out);
    request.resume = true;
    request.expected_sha256 = Some(sha256_hex(&data));

    let (fetcher, _cancel) = Fetcher::new(Arc::new(NullSink));
    let outcome = fetcher.run(request).await;
    match outcome {
        FetchOutcome::Success(s) => assert_eq!(s.bytes, data.len() as u64),
        FetchOutcome::Failure(f) => panic!("resume failed: {}", f.message),
    }
    assert_eq!(std::fs::read(&out).unwrap(), data);

    // Every data range starts at or after the resume point.
    let requests = server.received_requests().await.unwrap();
    let starts: Vec<u64> = requests
        .iter()
        .filter_map(|r| r.headers.get("range").and_then(|v| v.to_str().ok()))
        .filter_map(parse_range)
        .filter(|(s, e)| !(*s == 0 && *e == 0))
        .map(|(s, _)| s)
        .collect();
    assert!(!starts.is_empty());
    assert!(starts.iter().all(|&s| s >= half), "ranges {starts:?} dipped below {half}");
}

#[tokio::test]
async fn test_429_halves_concurrency_and_recovers() {
    let data = body_of(3 * 1024 * 1024);
    let server = MockServer::start().await;
    let mut responder = RangeServer::new(data.clone());
    responder.backoff_once = Some(Arc::new(AtomicBool::new(false)));
    mount_file(&server, responder, true).await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.bin");
    let url = format!("{}/file.bin", server.uri());

    let sink = Arc::new(RecordingSink::default());
    let (fetcher, _cancel) = Fetcher::new(sink.clone());
    let outcome = fetcher.run(file_request(&url, &out)).await;
    match outcome {
        FetchOutcome::Success(_) => {}
        FetchOutcome::Failure(f) => panic!("fetch failed: {}", f.message),
    }
    assert_eq!(std::fs::read(&out).unwrap(), data);

    let concurrency = sink.concurrency.lock().unwrap();
    assert!(
        concurrency
            .iter()
            .any(|(n, reason)| reason.as_str() == "throttled" && *n <= 4),
        "expected a throttle halving, saw {concurrency:?}"
    );
    let retries = sink.retries.lock().unwrap();
    assert!(
        retries.iter().any(|(cat, delay, _)| {
            cat.as_str() == "server_backoff" && *delay >= Duration::from_secs(1)
        }),
        "expected a server_backoff retry honoring Retry-After, saw {retries:?}"
    );
    drop(retries);

    // 3 chunks plus the retried one.
    assert!(data_range_requests(&server).await >= 4);
}

#[tokio::test]
async fn test_mirror_picks_lowest_latency() {
    let fast_body = body_of(300 * 1024);
    let mut slow_body = fast_body.clone();
    slow_body.reverse();

    let fast = MockServer::start().await;
    mount_file(&fast, RangeServer::new(fast_body.clone()), true).await;

    let mut slow_servers = Vec::new();
    for _ in 0..2 {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("ETag", ETAG)
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(RangeServer::new(slow_body.clone()))
            .mount(&server)
            .await;
        slow_servers.push(server);
    }

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.bin");
    let urls = vec![
        format!("{}/file.bin", slow_servers[0].uri()),
        format!("{}/file.bin", fast.uri()),
        format!("{}/file.bin", slow_servers[1].uri()),
    ];
    let mut request = FetchRequest::mirror(urls, OutputTarget::File(out.clone()));
    request.max_connections = 4;

    let (fetcher, _cancel) = Fetcher::new(Arc::new(NullSink));
    let outcome = fetcher.run(request).await;
    match outcome {
        FetchOutcome::Success(_) => {}
        FetchOutcome::Failure(f) => panic!("mirror fetch failed: {}", f.message),
    }
    assert_eq!(std::fs::read(&out).unwrap(), fast_body);

    // The losing mirrors saw the probe but moved no body bytes.
    for server in &slow_servers {
        assert_eq!(data_range_requests(server).await, 0);
    }
}

#[tokio::test]
async fn test_empty_object() {
    let server = MockServer::start().await;
    // No HEAD mock: the probe falls back to a ranged GET and sees an
    // empty 200.
    Mock::given(method("GET"))
        .and(path("/empty.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(Vec::<u8>::new()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("empty.bin");
    let url = format!("{}/empty.bin", server.uri());

    let (fetcher, _cancel) = Fetcher::new(Arc::new(NullSink));
    let outcome = fetcher.run(file_request(&url, &out)).await;
    let summary = match outcome {
        FetchOutcome::Success(s) => s,
        FetchOutcome::Failure(f) => panic!("empty fetch failed: {}", f.message),
    };
    assert_eq!(summary.bytes, 0);
    assert_eq!(
        summary.sha256,
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(std::fs::metadata(&out).unwrap().len(), 0);
}

#[tokio::test]
async fn test_fetch_twice_is_idempotent() {
    let data = body_of(400 * 1024);
    let server = MockServer::start().await;
    mount_file(&server, RangeServer::new(data.clone()), true).await;

    let dir = tempfile::tempdir().unwrap();
    let url = format!("{}/file.bin", server.uri());
    let mut digests = Vec::new();
    for name in ["a.bin", "b.bin"] {
        let out = dir.path().join(name);
        let (fetcher, _cancel) = Fetcher::new(Arc::new(NullSink));
        match fetcher.run(file_request(&url, &out)).await {
            FetchOutcome::Success(s) => digests.push(s.sha256),
            FetchOutcome::Failure(f) => panic!("fetch failed: {}", f.message),
        }
    }
    assert_eq!(digests[0], digests[1]);
    assert_eq!(
        std::fs::read(dir.path().join("a.bin")).unwrap(),
        std::fs::read(dir.path().join("b.bin")).unwrap()
    );
}
