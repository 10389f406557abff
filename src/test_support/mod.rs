//! Helpers shared by unit tests.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

/// Environment variable that turns a missing loopback socket into a failure.
pub const REQUIRE_SOCKETS_ENV: &str = "TILECRAWLER_REQUIRE_SOCKET_TESTS";

fn sockets_required() -> bool {
    std::env::var(REQUIRE_SOCKETS_ENV)
        .is_ok_and(|value| matches!(value.trim(), "1" | "true" | "yes"))
}

/// Starts a mock tile server, or returns `None` when loopback sockets are
/// unavailable and [`REQUIRE_SOCKETS_ENV`] is not set.
///
/// # Panics
///
/// Panics when sockets are unavailable but required.
#[track_caller]
pub fn mock_server() -> impl Future<Output = Option<MockServer>> {
    let usable = TcpListener::bind("127.0.0.1:0").is_ok();
    let caller = Location::caller();
    async move {
        if usable {
            return Some(MockServer::start().await);
        }
        assert!(
            !sockets_required(),
            "loopback socket unavailable at {caller} but {REQUIRE_SOCKETS_ENV} is set"
        );
        eprintln!("loopback socket unavailable at {caller}, skipping");
        None
    }
}

/// A payload accepted by the PNG validator, distinct per `seed`.
#[must_use]
pub fn png_tile(seed: u8) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(&[seed; 8]);
    bytes
}
