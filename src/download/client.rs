//! HTTP client wrapper for fetching tile payloads.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::HeaderMap;
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, default_user_agent};
use super::error::DownloadError;

/// Pooled HTTP client shared by every crawl worker.
///
/// Create it once per crawl; cloning is cheap and shares the pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with the default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
            .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client with explicit timeouts in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::ClientBuild`] when the TLS backend or system
    /// configuration cannot be initialized.
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(default_user_agent())
            .build()
            .map_err(DownloadError::ClientBuild)?;
        Ok(Self { client })
    }

    /// Fetches `url` and returns the full response body.
    ///
    /// `headers` are sent in addition to the client defaults and override the
    /// default User-Agent when they carry one.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the URL is malformed, the request fails
    /// or times out, or the server answers with a non-success status.
    #[instrument(level = "debug", skip(self, headers), fields(url = %url))]
    pub async fn fetch(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<Vec<u8>, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let mut request = self.client.get(url);
        if let Some(headers) = headers {
            request = request.headers(headers.clone());
        }

        let response = request.send().await.map_err(|e| map_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "non-success status");
            return Err(DownloadError::http_status(url, status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| map_reqwest(url, e))?;
        debug!(bytes = body.len(), "tile fetched");
        Ok(body.to_vec())
    }
}

fn map_reqwest(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}
