//! Error types for tile fetches.
//!
//! The crawler folds every variant into a single "no tile" outcome; the
//! variants exist so that logs say what actually went wrong.

use thiserror::Error;

/// Errors that can occur while fetching one tile.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The rendered tile URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The response body was rejected by the tile source.
    #[error("invalid tile payload from {url} ({bytes} bytes)")]
    InvalidTile {
        /// The URL that produced the payload.
        url: String,
        /// Payload size.
        bytes: usize,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a payload rejection error.
    pub fn invalid_tile(url: impl Into<String>, bytes: usize) -> Self {
        Self::InvalidTile {
            url: url.into(),
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_message() {
        let error = DownloadError::http_status("https://t0.example.com/1/0/0.png", 503);
        assert_eq!(
            error.to_string(),
            "HTTP 503 fetching https://t0.example.com/1/0/0.png"
        );
    }

    #[test]
    fn test_invalid_tile_message() {
        let error = DownloadError::invalid_tile("https://example.com/t.png", 12);
        assert!(error.to_string().contains("12 bytes"));
    }

    #[test]
    fn test_timeout_and_invalid_url_messages() {
        assert_eq!(
            DownloadError::timeout("https://example.com").to_string(),
            "timeout fetching https://example.com"
        );
        assert_eq!(
            DownloadError::invalid_url("nope").to_string(),
            "invalid URL: nope"
        );
    }
}
