//! Tile addressing and range math for Web Mercator tile pyramids.
//!
//! All functions here are pure. Rows use the XYZ convention (row 0 at the
//! north edge) unless a function name says otherwise; [`tms_row_flip`]
//! converts to and from the TMS convention used by MBTiles storage.

mod walker;

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use walker::{TileWalker, plan_index, plan_len, prev_tile};

/// Highest zoom level accepted anywhere in the crate.
///
/// Keeps `2^z` comfortably inside `u32` and `(2^z)^2` inside `u64`.
pub const MAX_ZOOM: u8 = 30;

/// Latitude limit of the spherical Mercator projection.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Errors produced when constructing addresses or levels.
#[derive(Debug, Error, PartialEq)]
pub enum TileError {
    /// Zoom level above [`MAX_ZOOM`].
    #[error("zoom level {z} exceeds maximum {MAX_ZOOM}")]
    ZoomOutOfRange {
        /// The rejected zoom level.
        z: u8,
    },

    /// Column or row outside `[0, 2^z)`.
    #[error("tile {x}/{y} is outside zoom level {z}")]
    OutOfRange {
        /// Zoom level.
        z: u8,
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },

    /// Bounding box with inverted or non-finite corners.
    #[error("invalid bbox {bbox:?}: {reason}")]
    InvalidBbox {
        /// The rejected box as `[min_lon, min_lat, max_lon, max_lat]`.
        bbox: [f64; 4],
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// A single tile in XYZ addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileAddress {
    /// Zoom level.
    pub z: u8,
    /// Column, west to east.
    pub x: u32,
    /// Row, north to south.
    pub y: u32,
}

impl TileAddress {
    /// Creates an address, checking that `x` and `y` lie inside zoom `z`.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::ZoomOutOfRange`] or [`TileError::OutOfRange`].
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self, TileError> {
        let address = Self { z, x, y };
        address.validate()?;
        Ok(address)
    }

    /// Checks the address invariants.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::ZoomOutOfRange`] or [`TileError::OutOfRange`].
    pub fn validate(&self) -> Result<(), TileError> {
        if self.z > MAX_ZOOM {
            return Err(TileError::ZoomOutOfRange { z: self.z });
        }
        let n = tiles_per_axis(self.z);
        if u64::from(self.x) >= n || u64::from(self.y) >= n {
            return Err(TileError::OutOfRange {
                z: self.z,
                x: self.x,
                y: self.y,
            });
        }
        Ok(())
    }

    /// Row of this tile in TMS order.
    #[must_use]
    pub fn tms_y(&self) -> u32 {
        tms_row_flip(self.y, self.z)
    }

    /// Quadtree key of this tile.
    #[must_use]
    pub fn quad_key(&self) -> String {
        quad_key(self.x, self.y, self.z)
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Geographic bounding box in degrees.
///
/// Serialized as `[min_lon, min_lat, max_lon, max_lat]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    /// Western edge.
    pub min_lon: f64,
    /// Southern edge.
    pub min_lat: f64,
    /// Eastern edge.
    pub max_lon: f64,
    /// Northern edge.
    pub max_lat: f64,
}

impl BBox {
    /// Web Mercator world bounds.
    pub const WORLD: Self = Self {
        min_lon: -180.0,
        min_lat: -85.0511,
        max_lon: 180.0,
        max_lat: 85.0511,
    };

    /// Creates a box from its corners.
    #[must_use]
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Checks that the box is finite, ordered and on the globe.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::InvalidBbox`] naming the first problem found.
    pub fn validate(&self) -> Result<(), TileError> {
        let reject = |reason| {
            Err(TileError::InvalidBbox {
                bbox: (*self).into(),
                reason,
            })
        };
        let corners: [f64; 4] = (*self).into();
        if corners.iter().any(|v| !v.is_finite()) {
            return reject("coordinates must be finite");
        }
        if self.min_lon > self.max_lon || self.min_lat > self.max_lat {
            return reject("minimum corner must not exceed maximum corner");
        }
        if self.min_lon < -180.0 || self.max_lon > 180.0 {
            return reject("longitude must lie within [-180, 180]");
        }
        if self.min_lat < -90.0 || self.max_lat > 90.0 {
            return reject("latitude must lie within [-90, 90]");
        }
        Ok(())
    }

    /// Smallest box containing both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min_lon: self.min_lon.min(other.min_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lon: self.max_lon.max(other.max_lon),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.min_lon, b.min_lat, b.max_lon, b.max_lat]
    }
}

/// Inclusive column/row bounds of a rectangular block of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    /// First column.
    pub min_x: u32,
    /// Last column.
    pub max_x: u32,
    /// First row.
    pub min_y: u32,
    /// Last row.
    pub max_y: u32,
}

impl TileRange {
    /// Every tile of zoom level `z`.
    #[must_use]
    pub fn full(z: u8) -> Self {
        let last = max_index(z);
        Self {
            min_x: 0,
            max_x: last,
            min_y: 0,
            max_y: last,
        }
    }

    /// Number of columns.
    #[must_use]
    pub fn width(&self) -> u64 {
        u64::from(self.max_x - self.min_x) + 1
    }

    /// Number of rows.
    #[must_use]
    pub fn height(&self) -> u64 {
        u64::from(self.max_y - self.min_y) + 1
    }

    /// Number of tiles in the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.width() * self.height()
    }

    /// Ranges always hold at least one tile.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `(x, y)` lies inside the range.
    #[must_use]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }
}

/// One entry of a crawl plan: a zoom level, optionally clipped to a bbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Zoom level.
    pub z: u8,
    /// Optional geographic clip. `None` covers the whole level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
}

impl Level {
    /// A whole zoom level.
    #[must_use]
    pub fn full(z: u8) -> Self {
        Self { z, bbox: None }
    }

    /// A zoom level clipped to `bbox`.
    #[must_use]
    pub fn clipped(z: u8, bbox: BBox) -> Self {
        Self { z, bbox: Some(bbox) }
    }

    /// Checks the zoom level and bbox.
    ///
    /// # Errors
    ///
    /// Returns the first [`TileError`] found.
    pub fn validate(&self) -> Result<(), TileError> {
        if self.z > MAX_ZOOM {
            return Err(TileError::ZoomOutOfRange { z: self.z });
        }
        if let Some(bbox) = &self.bbox {
            bbox.validate()?;
        }
        Ok(())
    }

    /// Tile range covered by this level.
    #[must_use]
    pub fn range(&self) -> TileRange {
        compute_tile_range(self)
    }
}

/// Number of tiles along one axis at zoom `z`.
#[must_use]
pub fn tiles_per_axis(z: u8) -> u64 {
    1u64 << z
}

#[allow(clippy::cast_possible_truncation)]
fn max_index(z: u8) -> u32 {
    (tiles_per_axis(z) - 1) as u32
}

/// Projects a longitude/latitude pair to the tile containing it.
///
/// Latitudes beyond the Mercator limit and longitudes at the antimeridian are
/// clamped onto the edge tiles.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn lon_lat_to_tile(lon: f64, lat: f64, z: u8) -> (u32, u32) {
    let n = tiles_per_axis(z) as f64;
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let s = lat.to_radians().sin();

    let x = ((lon + 180.0) / 360.0 * n).floor();
    let y = ((0.5 - ((1.0 + s) / (1.0 - s)).ln() / (4.0 * PI)) * n).floor();

    let last = f64::from(max_index(z));
    (x.clamp(0.0, last) as u32, y.clamp(0.0, last) as u32)
}

/// Tile range covering `bbox` at zoom `z`.
///
/// Projects the north-west and south-east corners and takes the per-axis
/// minimum and maximum, so the corner order of the box does not matter.
#[must_use]
pub fn bbox_to_tile_range(bbox: &BBox, z: u8) -> TileRange {
    let (ax, ay) = lon_lat_to_tile(bbox.min_lon, bbox.max_lat, z);
    let (cx, cy) = lon_lat_to_tile(bbox.max_lon, bbox.min_lat, z);
    TileRange {
        min_x: ax.min(cx),
        max_x: ax.max(cx),
        min_y: ay.min(cy),
        max_y: ay.max(cy),
    }
}

/// Converts a row between XYZ and TMS numbering. Applying it twice is a no-op.
#[must_use]
pub fn tms_row_flip(y: u32, z: u8) -> u32 {
    max_index(z) - y
}

/// Encodes a tile as a quadtree key, most significant level first.
///
/// Each digit is `2 * y_bit + x_bit`; the key has exactly `z` digits.
#[must_use]
pub fn quad_key(x: u32, y: u32, z: u8) -> String {
    (1..=z)
        .rev()
        .map(|i| {
            let mask = 1u32 << (i - 1);
            let mut digit = b'0';
            if x & mask != 0 {
                digit += 1;
            }
            if y & mask != 0 {
                digit += 2;
            }
            char::from(digit)
        })
        .collect()
}

/// Tile range of a level: its bbox projection, or the whole level.
#[must_use]
pub fn compute_tile_range(level: &Level) -> TileRange {
    match &level.bbox {
        Some(bbox) => bbox_to_tile_range(bbox, level.z),
        None => TileRange::full(level.z),
    }
}
