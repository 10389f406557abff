//! MBTiles metadata derived from a crawl plan.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tile::{BBox, Level};

/// MBTiles `type` value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    /// A standalone base map.
    Baselayer,
    /// A layer drawn over a base map.
    #[default]
    Overlay,
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Baselayer => "baselayer",
            Self::Overlay => "overlay",
        })
    }
}

/// Key/value metadata written alongside the tiles table.
#[derive(Debug, Clone, PartialEq)]
pub struct TileMetadata {
    /// Human-readable tileset name.
    pub name: String,
    /// Payload format (`png`, `jpg`, `webp`).
    pub format: String,
    /// Lowest zoom level present.
    pub min_zoom: u8,
    /// Highest zoom level present.
    pub max_zoom: u8,
    /// Geographic extent.
    pub bounds: BBox,
    /// Default view as `(lon, lat, zoom)`.
    pub center: (f64, f64, u8),
    /// Layer kind.
    pub layer_type: LayerType,
    /// Attribution string, if any.
    pub attribution: Option<String>,
}

impl TileMetadata {
    /// Derives metadata from the levels of a crawl plan.
    ///
    /// Bounds are the union of all level bboxes, or the world when no level
    /// is clipped. The center sits in the middle of the bounds at the middle
    /// zoom. Returns `None` for an empty plan.
    #[must_use]
    pub fn from_levels(name: &str, format: &str, levels: &[Level]) -> Option<Self> {
        let min_zoom = levels.iter().map(|l| l.z).min()?;
        let max_zoom = levels.iter().map(|l| l.z).max()?;

        let bounds = levels
            .iter()
            .filter_map(|l| l.bbox)
            .reduce(|acc, b| acc.union(&b))
            .unwrap_or(BBox::WORLD);

        let center = (
            (bounds.min_lon + bounds.max_lon) / 2.0,
            (bounds.min_lat + bounds.max_lat) / 2.0,
            min_zoom + (max_zoom - min_zoom) / 2,
        );

        Some(Self {
            name: name.to_string(),
            format: format.to_string(),
            min_zoom,
            max_zoom,
            bounds,
            center,
            layer_type: LayerType::default(),
            attribution: None,
        })
    }

    /// Sets the layer type.
    #[must_use]
    pub fn with_layer_type(mut self, layer_type: LayerType) -> Self {
        self.layer_type = layer_type;
        self
    }

    /// Sets the attribution.
    #[must_use]
    pub fn with_attribution(mut self, attribution: Option<String>) -> Self {
        self.attribution = attribution;
        self
    }

    /// Rows of the metadata table in insertion order.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let b = &self.bounds;
        let mut pairs = vec![
            ("name", self.name.clone()),
            ("format", self.format.clone()),
            ("minzoom", self.min_zoom.to_string()),
            ("maxzoom", self.max_zoom.to_string()),
            (
                "bounds",
                format!("{},{},{},{}", b.min_lon, b.min_lat, b.max_lon, b.max_lat),
            ),
            (
                "center",
                format!("{:.6},{:.6},{}", self.center.0, self.center.1, self.center.2),
            ),
            ("type", self.layer_type.to_string()),
        ];
        if let Some(attribution) = &self.attribution {
            pairs.push(("attribution", attribution.clone()));
        }
        pairs
    }
}
