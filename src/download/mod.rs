//! Tile fetching: HTTP client, fetch errors, adaptive pacing and retry policy.
//!
//! # Example
//!
//! ```no_run
//! use tilecrawler_core::download::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let bytes = client.fetch("https://tile.example.com/3/4/2.png", None).await?;
//! println!("fetched {} bytes", bytes.len());
//! # Ok(())
//! # }
//! ```

mod client;
mod constants;
mod error;
pub mod rate_limiter;
mod retry;

pub use client::HttpClient;
pub use constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, default_user_agent};
pub use error::DownloadError;
pub use rate_limiter::{DelayConfig, RateLimiter};
pub use retry::{DEFAULT_MAX_RETRIES, RetryDecision, RetryPolicy, WorkItem};
