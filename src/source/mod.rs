//! Tile source policies: where tiles come from and what a good one looks like.
//!
//! The crawler only talks to the [`TileSource`] trait. [`TemplateSource`]
//! covers the common case of a URL template with rotating subdomains.

mod format;
mod template;

use reqwest::header::HeaderMap;
use thiserror::Error;

use crate::sink::TileMetadata;
use crate::tile::{Level, TileAddress};

pub use format::TileFormat;
pub use template::TemplateSource;

/// Errors raised while building a tile source.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The URL template cannot address individual tiles.
    #[error("URL template {template:?} needs {{z}}, {{x}} and {{y}} (or {{-y}}), or {{q}}")]
    MissingPlaceholder {
        /// The rejected template.
        template: String,
    },

    /// The template uses `{s}` but no subdomains were configured.
    #[error("URL template uses {{s}} but no subdomains are configured")]
    SubdomainsRequired,

    /// A request header name or value is not valid HTTP.
    #[error("invalid request header {name:?}: {reason}")]
    InvalidHeader {
        /// Header name as configured.
        name: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Strategy describing one remote tile service.
///
/// Implementations must be cheap to call concurrently; the crawler shares a
/// single instance across all workers.
pub trait TileSource: Send + Sync {
    /// Display name, also used as the default tileset name.
    fn name(&self) -> &str;

    /// URL of one tile. `counter` increases with every request and may be
    /// used to rotate between mirrors.
    fn tile_url(&self, address: TileAddress, counter: u64) -> String;

    /// Extra headers sent with every request.
    fn request_headers(&self) -> Option<&HeaderMap> {
        None
    }

    /// Whether a response body is a usable tile.
    fn validate_tile(&self, bytes: &[u8]) -> bool;

    /// Extension of tile files in the file-tree sink.
    fn file_extension(&self) -> &str {
        "png"
    }

    /// Metadata written to the tile store after a crawl.
    fn metadata(&self, _levels: &[Level]) -> Option<TileMetadata> {
        None
    }
}
