//! End-to-end engine tests against an in-process mock transport.
//!
//! The mock serves scripted bodies, failures and encodings so the full
//! pipeline - probe, plan, stream, decode, verify, rename, checkpoint -
//! runs without touching the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use md5::{Digest as _, Md5};
use parking_lot::Mutex;
use tempfile::TempDir;

use bulkfetch::{
    BoxFuture, DownloadStatus, Engine, EngineConfig, FetchRequest, ProbeInfo, Protocol,
    Transport, TransportError, TransportResponse, VerifyState,
};
use bulkfetch::transport::ContentEncoding;

// ---------------------------------------------------------------------------
// Mock transport
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct MockFile {
    /// Expected decoded content.
    decoded: Vec<u8>,
    /// Bytes actually served (encoded form when `encoding` is set).
    wire: Vec<u8>,
    encoding: ContentEncoding,
    supports_range: bool,
    /// Serve only this many bytes on the first open, then fail with a
    /// connection reset.
    cut_first_open_after: Option<usize>,
    /// Sleep between chunks, to keep bodies in flight for cancellation.
    chunk_delay: Option<Duration>,
    /// Answer ranged requests with a full 200 body.
    ignore_range: bool,
}

impl MockFile {
    fn plain(content: &[u8]) -> Self {
        Self {
            decoded: content.to_vec(),
            wire: content.to_vec(),
            encoding: ContentEncoding::Identity,
            supports_range: true,
            cut_first_open_after: None,
            chunk_delay: None,
            ignore_range: false,
        }
    }

    fn gzipped(content: &[u8]) -> Self {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        let wire = encoder.finish().unwrap();

        Self {
            wire,
            ..Self::plain(content)
        }
        .with_encoding(ContentEncoding::Gzip)
    }

    fn with_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

struct MockTransport {
    files: Mutex<HashMap<String, MockFile>>,
    protocol: Mutex<Protocol>,
    opens: Mutex<Vec<FetchRequest>>,
    opens_per_url: Mutex<HashMap<String, u32>>,
}

impl MockTransport {
    fn new(protocol: Protocol) -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            protocol: Mutex::new(protocol),
            opens: Mutex::new(Vec::new()),
            opens_per_url: Mutex::new(HashMap::new()),
        })
    }

    fn insert(&self, url: &str, file: MockFile) {
        self.files.lock().insert(url.to_string(), file);
    }

    fn open_log(&self) -> Vec<FetchRequest> {
        self.opens.lock().clone()
    }

    fn chunked(body: &[u8], chunk: usize) -> Vec<Result<Bytes, TransportError>> {
        body.chunks(chunk.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }
}

impl Transport for MockTransport {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProbeInfo, TransportError>> {
        let result = match self.files.lock().get(url) {
            Some(file) => Ok(ProbeInfo {
                supports_range: file.supports_range,
                total_size: Some(file.decoded.len() as u64),
                etag: Some("\"mock-etag\"".to_string()),
                last_modified: None,
                server_encoding: None,
            }),
            None => Err(TransportError::BadStatus(404)),
        };
        Box::pin(async move { result })
    }

    fn open<'a>(
        &'a self,
        request: FetchRequest,
    ) -> BoxFuture<'a, Result<TransportResponse, TransportError>> {
        self.opens.lock().push(request.clone());
        let nth_open = {
            let mut counts = self.opens_per_url.lock();
            let n = counts.entry(request.url.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let Some(file) = self.files.lock().get(&request.url).cloned() else {
            return Box::pin(async { Err(TransportError::BadStatus(404)) });
        };

        let honour_range = request.range_start.is_some() && file.supports_range && !file.ignore_range;
        let start = if honour_range {
            request.range_start.unwrap_or(0) as usize
        } else {
            0
        };
        let body = file.wire[start.min(file.wire.len())..].to_vec();

        let mut chunks = Self::chunked(&body, 8192);
        if nth_open == 1 {
            if let Some(cut) = file.cut_first_open_after {
                chunks = Self::chunked(&body[..cut.min(body.len())], 8192);
                chunks.push(Err(TransportError::Connect(
                    "connection reset by peer".to_string(),
                )));
            }
        }

        let protocol = *self.protocol.lock();
        let content_length = Some(body.len() as u64);
        let encoding = file.encoding;
        let delay = file.chunk_delay;

        let stream = futures_util::stream::iter(chunks);
        let body: bulkfetch::transport::ByteStream = match delay {
            Some(delay) => Box::pin(stream.then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            })),
            None => Box::pin(stream),
        };

        Box::pin(async move {
            Ok(TransportResponse {
                status: if honour_range { 206 } else { 200 },
                is_partial: honour_range,
                content_length,
                content_encoding: encoding,
                protocol,
                body,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn manifest_entry(name: &str, url: &str, content: &[u8]) -> String {
    format!(
        r#""{name}": {{ "url": "{url}", "digest": {{ "algorithm": "md5", "value": "{}" }}, "size": {} }}"#,
        md5_hex(content),
        content.len()
    )
}

struct Fixture {
    _dirs: (TempDir, TempDir),
    engine: Arc<Engine>,
    transport: Arc<MockTransport>,
    root: std::path::PathBuf,
    state_path: std::path::PathBuf,
}

async fn fixture(entries: &[(&str, &[u8], MockFile)], tune: impl FnOnce(&mut EngineConfig)) -> Fixture {
    let state_dir = TempDir::new().unwrap();
    let root_dir = TempDir::new().unwrap();
    let root = root_dir.path().to_path_buf();
    let state_path = state_dir.path().join("state.json");

    let transport = MockTransport::new(Protocol::Http2);
    let mut manifest_parts = Vec::new();
    for (name, content, file) in entries {
        let url = format!("https://cdn.example.com/{name}");
        transport.insert(&url, file.clone());
        manifest_parts.push(manifest_entry(name, &url, content));
    }
    let manifest_path = state_dir.path().join("manifest.json");
    std::fs::write(&manifest_path, format!("{{{}}}", manifest_parts.join(","))).unwrap();

    let mut config = EngineConfig {
        state_path: state_path.clone(),
        retry_base: Duration::from_millis(10),
        retry_cap: Duration::from_millis(50),
        resume_threshold: 1024,
        ..Default::default()
    };
    tune(&mut config);

    let mock: Arc<dyn Transport> = transport.clone();
    let engine = Arc::new(Engine::new(config).unwrap().with_transport(mock));
    engine.load_manifest(&manifest_path).await.unwrap();
    engine.set_download_root(&root).await.unwrap();

    Fixture {
        _dirs: (state_dir, root_dir),
        engine,
        transport,
        root,
        state_path,
    }
}

async fn record_of(engine: &Engine, name: &str) -> bulkfetch::ProgressRecord {
    engine
        .records()
        .await
        .into_iter()
        .find(|r| r.name == name)
        .expect("record exists")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_file_completes_with_zero_bytes() {
    let fx = fixture(
        &[("a.json", b"".as_slice(), MockFile::plain(b""))],
        |_| {},
    )
    .await;

    let summary = fx.engine.start().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 0);

    let on_disk = fx.root.join("a.json");
    assert!(on_disk.exists());
    assert_eq!(std::fs::metadata(&on_disk).unwrap().len(), 0);
    assert!(!fx.root.join("a.json.part").exists());

    let record = record_of(&fx.engine, "a.json").await;
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.verification, VerifyState::Verified);
    assert_eq!(record.attempts, 1);
}

#[tokio::test]
async fn interrupted_transfer_resumes_with_range_request() {
    let content: Vec<u8> = (0..65_536u32).map(|i| (i % 251) as u8).collect();
    let file = MockFile {
        cut_first_open_after: Some(24_576),
        ..MockFile::plain(&content)
    };

    let fx = fixture(&[("big.bin", content.as_slice(), file)], |_| {}).await;
    let summary = fx.engine.start().await.unwrap();
    assert_eq!(summary.completed, 1);

    let record = record_of(&fx.engine, "big.bin").await;
    assert_eq!(record.attempts, 2);
    assert_eq!(record.total_bytes, Some(content.len() as u64));

    let written = std::fs::read(fx.root.join("big.bin")).unwrap();
    assert_eq!(written, content);

    // Second open must have asked for the remainder.
    let opens = fx.transport.open_log();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0].range_start, None);
    assert_eq!(opens[1].range_start, Some(24_576));
}

#[tokio::test]
async fn server_ignoring_range_restarts_from_zero() {
    let content: Vec<u8> = (0..50_000u32).map(|i| (i % 199) as u8).collect();
    let file = MockFile {
        cut_first_open_after: Some(20_000),
        ignore_range: true,
        ..MockFile::plain(&content)
    };

    let fx = fixture(&[("stubborn.bin", content.as_slice(), file)], |_| {}).await;
    let summary = fx.engine.start().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(std::fs::read(fx.root.join("stubborn.bin")).unwrap(), content);
}

#[tokio::test]
async fn digest_change_on_reload_forces_refetch() {
    let old_content = b"version-one-payload!";
    let new_content = b"version-two-payload!"; // same length on purpose

    let fx = fixture(
        &[("asset.bin", old_content.as_slice(), MockFile::plain(old_content))],
        |_| {},
    )
    .await;
    let summary = fx.engine.start().await.unwrap();
    assert_eq!(summary.completed, 1);

    // New manifest: same name and URL, new digest and content.
    let url = "https://cdn.example.com/asset.bin";
    fx.transport.insert(url, MockFile::plain(new_content));
    let manifest_path = fx.state_path.parent().unwrap().join("manifest2.json");
    std::fs::write(
        &manifest_path,
        format!("{{{}}}", manifest_entry("asset.bin", url, new_content)),
    )
    .unwrap();

    let diff = fx.engine.load_manifest(&manifest_path).await.unwrap();
    assert_eq!(diff.updated, vec!["asset.bin".to_string()]);

    let record = record_of(&fx.engine, "asset.bin").await;
    assert_eq!(record.status, DownloadStatus::Pending);

    // The stale local file must not short-circuit the fetch: it has the
    // right size, so the planner says VerifyOnly, verification fails, and
    // the corruption-protection refetch kicks in.
    let summary = fx.engine.start().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(std::fs::read(fx.root.join("asset.bin")).unwrap(), new_content);
}

#[tokio::test]
async fn cancellation_rewinds_in_flight_tasks_to_pending() {
    let content: Vec<u8> = (0..40_960u32).map(|i| (i % 241) as u8).collect();
    let mut entries = Vec::new();
    for i in 0..8 {
        let file = MockFile {
            chunk_delay: Some(Duration::from_millis(20)),
            ..MockFile::plain(&content)
        };
        entries.push((format!("slow-{i}.bin"), file));
    }
    let borrowed: Vec<(&str, &[u8], MockFile)> = entries
        .iter()
        .map(|(name, file)| (name.as_str(), content.as_slice(), file.clone()))
        .collect();

    let fx = fixture(&borrowed, |_| {}).await;

    let engine = Arc::clone(&fx.engine);
    let run = tokio::spawn(async move { engine.start().await });

    tokio::time::sleep(Duration::from_millis(80)).await;
    fx.engine.cancel();
    let summary = run.await.unwrap().unwrap();

    assert!(summary.cancelled > 0, "expected cancelled tasks, got {summary:?}");

    for record in fx.engine.records().await {
        assert_ne!(record.status, DownloadStatus::InProgress, "{}", record.name);
        if record.status == DownloadStatus::Pending {
            let part = fx.root.join(record.part_path());
            let on_disk = std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
            assert_eq!(
                record.bytes_downloaded, on_disk,
                "{}: record and .part disagree",
                record.name
            );
        }
    }

    // The persisted state must agree: nothing in progress.
    let persisted = std::fs::read_to_string(&fx.state_path).unwrap();
    assert!(!persisted.contains("in_progress"));
}

#[tokio::test]
async fn protocol_statistics_count_requests_per_family() {
    let mut entries = Vec::new();
    let content = b"payload".to_vec();
    for i in 0..50 {
        entries.push((format!("f{i}.bin"), MockFile::plain(&content)));
    }
    let borrowed: Vec<(&str, &[u8], MockFile)> = entries
        .iter()
        .map(|(name, file)| (name.as_str(), content.as_slice(), file.clone()))
        .collect();

    let fx = fixture(&borrowed, |_| {}).await;
    *fx.transport.protocol.lock() = Protocol::Http1;

    let summary = fx.engine.start().await.unwrap();
    assert_eq!(summary.completed, 50);

    let stats = fx.engine.statistics().await;
    assert_eq!(stats.h2_requests, 0);
    assert!(stats.h1_requests >= 50);
    assert!(stats.connection_reuse_ratio > 0.0);
    assert_eq!(stats.by_state.get("completed"), Some(&50));
}

#[tokio::test]
async fn gzip_bodies_report_raw_and_decoded_bytes() {
    // Repetitive JSON compresses well, so decoded > raw.
    let a: Vec<u8> = br#"{"key": "value", "key": "value", "key": "value", "key": "value"}"#
        .iter()
        .cycle()
        .take(4096)
        .copied()
        .collect();
    let b = a.clone();

    let fx = fixture(
        &[
            ("a.json", a.as_slice(), MockFile::gzipped(&a)),
            ("b.json", b.as_slice(), MockFile::gzipped(&b)),
        ],
        |_| {},
    )
    .await;

    let summary = fx.engine.start().await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(std::fs::read(fx.root.join("a.json")).unwrap(), a);

    let stats = fx.engine.statistics().await;
    assert!(
        stats.decoded_bytes > stats.raw_bytes,
        "decoded {} should exceed raw {}",
        stats.decoded_bytes,
        stats.raw_bytes
    );
    assert!(stats.compression_ratio < 1.0);
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let content = b"stable content";
    let fx = fixture(
        &[("a.bin", content.as_slice(), MockFile::plain(content))],
        |_| {},
    )
    .await;

    let first = fx.engine.start().await.unwrap();
    assert_eq!(first.completed, 1);
    let bytes_after_first = std::fs::read(fx.root.join("a.bin")).unwrap();

    // Explicitly select everything; the completed fast path must skip
    // without re-downloading.
    fx.engine.select(vec!["a.bin".to_string()]);
    let second = fx.engine.start().await.unwrap();
    assert_eq!(second.completed, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(second.failed, 0);

    assert_eq!(std::fs::read(fx.root.join("a.bin")).unwrap(), bytes_after_first);
    // No extra GET was issued for the skip.
    assert_eq!(fx.transport.open_log().len(), 1);
}

#[tokio::test]
async fn persistent_corruption_fails_after_one_refetch() {
    let content = b"served content";
    // Manifest digest comes from different content than the server returns.
    let fx = fixture(
        &[("bad.bin", b"expected content".as_slice(), MockFile::plain(content))],
        |_| {},
    )
    .await;

    let summary = fx.engine.start().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 0);

    let record = record_of(&fx.engine, "bad.bin").await;
    assert_eq!(record.status, DownloadStatus::VerifyFailed);
    assert_eq!(record.verification, VerifyState::VerifyFailed);
    assert!(record.last_error.as_deref().unwrap_or("").contains("mismatch"));

    // Exactly two fetches: the original and the corruption-protection retry.
    assert_eq!(fx.transport.open_log().len(), 2);
    // Nothing corrupt is left behind.
    assert!(!fx.root.join("bad.bin").exists());
    assert!(!fx.root.join("bad.bin.part").exists());

    // Starting again against the same loaded manifest does not grant a
    // fresh refetch: one more fetch, one more mismatch, still failed.
    let summary = fx.engine.start().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(fx.transport.open_log().len(), 3);

    // Reloading the manifest renews the allowance.
    let manifest_path = fx.state_path.parent().unwrap().join("manifest-again.json");
    std::fs::write(
        &manifest_path,
        format!(
            "{{{}}}",
            manifest_entry("bad.bin", "https://cdn.example.com/bad.bin", b"expected content")
        ),
    )
    .unwrap();
    fx.engine.load_manifest(&manifest_path).await.unwrap();

    let record = record_of(&fx.engine, "bad.bin").await;
    assert!(!record.verify_refetch_used);
}

#[tokio::test]
async fn transient_server_errors_exhaust_retry_budget() {
    struct FailingTransport;
    impl Transport for FailingTransport {
        fn probe<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<ProbeInfo, TransportError>> {
            Box::pin(async { Err(TransportError::ServerError(503)) })
        }
        fn open<'a>(
            &'a self,
            _request: FetchRequest,
        ) -> BoxFuture<'a, Result<TransportResponse, TransportError>> {
            Box::pin(async { Err(TransportError::ServerError(503)) })
        }
    }

    let state_dir = TempDir::new().unwrap();
    let root_dir = TempDir::new().unwrap();
    let manifest_path = state_dir.path().join("manifest.json");
    std::fs::write(
        &manifest_path,
        format!(
            "{{{}}}",
            manifest_entry("a.bin", "https://cdn.example.com/a.bin", b"x")
        ),
    )
    .unwrap();

    let engine = Engine::new(EngineConfig {
        state_path: state_dir.path().join("state.json"),
        max_attempts: 3,
        retry_base: Duration::from_millis(5),
        retry_cap: Duration::from_millis(20),
        ..Default::default()
    })
    .unwrap()
    .with_transport(Arc::new(FailingTransport));

    engine.load_manifest(&manifest_path).await.unwrap();
    engine.set_download_root(root_dir.path()).await.unwrap();

    let summary = engine.start().await.unwrap();
    assert_eq!(summary.failed, 1);

    let record = engine
        .records()
        .await
        .into_iter()
        .find(|r| r.name == "a.bin")
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert!(record.last_error.is_some());
}
