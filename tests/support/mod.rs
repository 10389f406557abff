//! Shared helpers for integration tests: mock tile servers and crawl setup.

#![allow(dead_code)]

use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tilecrawler_core::{CrawlerOptions, SinkMode, TemplateSource, TileFormat};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

const REQUIRE_SOCKETS_ENV: &str = "TILECRAWLER_REQUIRE_SOCKET_TESTS";

/// Starts a mock server, or returns `None` when loopback sockets are
/// unavailable (sandboxed CI). Set `TILECRAWLER_REQUIRE_SOCKET_TESTS=1` to
/// turn the skip into a failure.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if TcpListener::bind("127.0.0.1:0").is_ok() {
        return Some(MockServer::start().await);
    }
    let required = std::env::var(REQUIRE_SOCKETS_ENV)
        .is_ok_and(|value| matches!(value.trim(), "1" | "true" | "yes"));
    assert!(
        !required,
        "loopback socket unavailable but {REQUIRE_SOCKETS_ENV} is set"
    );
    eprintln!("loopback socket unavailable, skipping");
    None
}

/// A payload accepted by the PNG validator.
pub fn png_tile(seed: u8) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(&[seed; 8]);
    bytes
}

/// Serves a valid PNG for every `/{z}/{x}/{y}.png` request.
pub async fn mount_tile_server(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/\d+/\d+/\d+\.png$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_tile(1)))
        .mount(server)
        .await;
}

/// Like [`mount_tile_server`], but every response is held back by `delay`.
pub async fn mount_slow_tile_server(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/\d+/\d+/\d+\.png$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(png_tile(1))
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

/// Responder failing the first `fail_count` requests with 500.
pub struct FlakyResponder {
    request_count: Arc<AtomicUsize>,
    fail_count: usize,
    success_body: Vec<u8>,
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let n = self.request_count.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_count {
            ResponseTemplate::new(500).set_body_bytes(b"internal server error".to_vec())
        } else {
            ResponseTemplate::new(200).set_body_bytes(self.success_body.clone())
        }
    }
}

/// Makes one tile path flaky; takes precedence over [`mount_tile_server`].
/// Returns the request counter of that path.
pub async fn mount_flaky_tile(
    server: &MockServer,
    tile_path: &str,
    fail_count: usize,
) -> Arc<AtomicUsize> {
    let request_count = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .and(path(tile_path))
        .respond_with(FlakyResponder {
            request_count: Arc::clone(&request_count),
            fail_count,
            success_body: png_tile(2),
        })
        .with_priority(1)
        .mount(server)
        .await;
    request_count
}

/// Source pointing at the mock server.
pub fn mock_source(server: &MockServer) -> TemplateSource {
    TemplateSource::new(
        "Mock Tiles",
        format!("{}/{{z}}/{{x}}/{{y}}.png", server.uri()),
        TileFormat::Png,
    )
    .expect("valid template")
}

/// Options writing under `dir` with pacing disabled.
pub fn fast_options(dir: &Path, mode: SinkMode) -> CrawlerOptions {
    CrawlerOptions {
        mode,
        concurrency: 4,
        max_retry: 1,
        delay_ms: 0,
        min_delay_ms: 0,
        max_delay_ms: 0,
        out_dir: dir.join("tiles"),
        tile_store_path: dir.join("tiles.mbtiles"),
        progress_file: dir.join("progress.json"),
        repair_workers: 2,
        checkpoint_every: 4,
        ..CrawlerOptions::default()
    }
}

/// Number of requests the server has seen.
pub async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map_or(0, |r| r.len())
}
