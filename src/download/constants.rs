//! Constants for the download module.

/// Default HTTP connect timeout in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default HTTP read timeout in seconds. Tiles are small.
pub const READ_TIMEOUT_SECS: u64 = 30;

/// Default User-Agent sent when the tile source sets none.
#[must_use]
pub fn default_user_agent() -> String {
    format!("tilecrawler/{}", env!("CARGO_PKG_VERSION"))
}
