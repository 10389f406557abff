//! URL-template tile source.
//!
//! Placeholders:
//!
//! | placeholder | value |
//! |---|---|
//! | `{z}` | zoom level |
//! | `{x}` | column |
//! | `{y}` | row, XYZ order |
//! | `{-y}` | row, TMS order |
//! | `{q}` | quadkey |
//! | `{s}` | subdomain, rotated per request |

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{SourceError, TileFormat, TileSource};
use crate::sink::{LayerType, TileMetadata};
use crate::tile::{Level, TileAddress};

/// Tile source driven by a URL template.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    name: String,
    template: String,
    subdomains: Vec<String>,
    headers: HeaderMap,
    format: TileFormat,
    layer_type: LayerType,
    attribution: Option<String>,
}

impl TemplateSource {
    /// Creates a source, checking that the template addresses single tiles.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::MissingPlaceholder`].
    pub fn new(
        name: impl Into<String>,
        template: impl Into<String>,
        format: TileFormat,
    ) -> Result<Self, SourceError> {
        let template = template.into();
        let has = |p: &str| template.contains(p);
        let xyz = has("{z}") && has("{x}") && (has("{y}") || has("{-y}"));
        if !xyz && !has("{q}") {
            return Err(SourceError::MissingPlaceholder { template });
        }

        Ok(Self {
            name: name.into(),
            template,
            subdomains: Vec::new(),
            headers: HeaderMap::new(),
            format,
            layer_type: LayerType::default(),
            attribution: None,
        })
    }

    /// Sets the subdomains substituted for `{s}`.
    #[must_use]
    pub fn with_subdomains<I, S>(mut self, subdomains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subdomains = subdomains.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a header sent with every request.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidHeader`] for malformed names or values.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, SourceError> {
        let invalid = |reason: String| SourceError::InvalidHeader {
            name: name.to_string(),
            reason,
        };
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Sets the MBTiles layer type.
    #[must_use]
    pub fn with_layer_type(mut self, layer_type: LayerType) -> Self {
        self.layer_type = layer_type;
        self
    }

    /// Sets the MBTiles attribution.
    #[must_use]
    pub fn with_attribution(mut self, attribution: impl Into<String>) -> Self {
        self.attribution = Some(attribution.into());
        self
    }

    /// Checks settings that depend on each other.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::SubdomainsRequired`] when `{s}` has nothing to
    /// rotate through.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.template.contains("{s}") && self.subdomains.is_empty() {
            return Err(SourceError::SubdomainsRequired);
        }
        Ok(())
    }

    /// Payload format.
    #[must_use]
    pub fn format(&self) -> TileFormat {
        self.format
    }

    /// URL template.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    fn subdomain(&self, counter: u64) -> &str {
        if self.subdomains.is_empty() {
            return "";
        }
        let len = self.subdomains.len() as u64;
        usize::try_from(counter % len)
            .ok()
            .and_then(|i| self.subdomains.get(i))
            .map_or("", String::as_str)
    }
}

impl TileSource for TemplateSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn tile_url(&self, address: TileAddress, counter: u64) -> String {
        let mut url = self
            .template
            .replace("{z}", &address.z.to_string())
            .replace("{x}", &address.x.to_string())
            .replace("{y}", &address.y.to_string())
            .replace("{-y}", &address.tms_y().to_string());
        if url.contains("{q}") {
            url = url.replace("{q}", &address.quad_key());
        }
        if url.contains("{s}") {
            url = url.replace("{s}", self.subdomain(counter));
        }
        url
    }

    fn request_headers(&self) -> Option<&HeaderMap> {
        if self.headers.is_empty() {
            None
        } else {
            Some(&self.headers)
        }
    }

    fn validate_tile(&self, bytes: &[u8]) -> bool {
        self.format.matches(bytes)
    }

    fn file_extension(&self) -> &str {
        self.format.extension()
    }

    fn metadata(&self, levels: &[Level]) -> Option<TileMetadata> {
        TileMetadata::from_levels(&self.name, self.format.extension(), levels).map(|m| {
            m.with_layer_type(self.layer_type)
                .with_attribution(self.attribution.clone())
        })
    }
}
