//! Payload formats and their signature checks.

use std::fmt;

use serde::{Deserialize, Serialize};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// Image format served by a tile source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    /// PNG, checked against the 8-byte signature.
    #[default]
    Png,
    /// JPEG, checked against the SOI marker.
    #[serde(alias = "jpeg")]
    Jpg,
    /// WebP, checked against the RIFF/WEBP header.
    Webp,
    /// Anything non-empty.
    Any,
}

impl TileFormat {
    /// File extension used by the file-tree sink.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Webp => "webp",
            Self::Any => "tile",
        }
    }

    /// Whether `bytes` looks like a payload of this format.
    #[must_use]
    pub fn matches(&self, bytes: &[u8]) -> bool {
        match self {
            Self::Png => bytes.len() > PNG_SIGNATURE.len() && bytes.starts_with(&PNG_SIGNATURE),
            Self::Jpg => bytes.starts_with(&JPEG_SIGNATURE),
            Self::Webp => {
                bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP".as_slice())
            }
            Self::Any => !bytes.is_empty(),
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}
