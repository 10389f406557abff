//! Per-zoom progress bitmaps for the file-tree sink.
//!
//! Each zoom level `z` has one packed bit array of `ceil((2^z)^2 / 8)` bytes
//! stored at `<root>/.progress/z<z>.bit`. Bit `y * 2^z + x` is set once the
//! tile `(z, x, y)` has been written. Bits are never cleared.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::tile::{TileAddress, tiles_per_axis};

/// Name of the directory holding bitmap files, relative to the sink root.
pub const PROGRESS_DIR: &str = ".progress";

/// Largest bitmap kept in memory: zoom 17, 2 GiB.
pub const MAX_BITMAP_BYTES: u64 = 1 << 31;

/// Highest zoom level whose bitmap fits under [`MAX_BITMAP_BYTES`].
pub const MAX_BITMAP_ZOOM: u8 = 17;

/// Errors raised while loading or flushing bitmaps.
#[derive(Debug, Error)]
pub enum BitmapError {
    /// Reading or writing a bitmap file failed.
    #[error("bitmap IO error at {path}: {source}")]
    Io {
        /// The bitmap file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The bitmap for this zoom level exceeds [`MAX_BITMAP_BYTES`] or could
    /// not be allocated.
    #[error("bitmap for zoom {z} needs {bytes} bytes, more than can be held in memory")]
    TooLarge {
        /// Zoom level.
        z: u8,
        /// Required size.
        bytes: u64,
    },
}

/// Number of bytes backing the bitmap of zoom level `z`.
#[must_use]
pub fn bitmap_len(z: u8) -> u64 {
    let n = tiles_per_axis(z);
    (n * n).div_ceil(8)
}

/// Lazily loaded set of per-zoom bitmaps rooted at a sink directory.
#[derive(Debug)]
pub struct ProgressBitmap {
    dir: PathBuf,
    maps: HashMap<u8, Vec<u8>>,
    dirty: BTreeSet<u8>,
}

impl ProgressBitmap {
    /// Creates a bitmap set for the sink rooted at `root`. Nothing is read yet.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(PROGRESS_DIR),
            maps: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Path of the backing file for zoom level `z`.
    #[must_use]
    pub fn file_path(&self, z: u8) -> PathBuf {
        self.dir.join(format!("z{z}.bit"))
    }

    /// Whether the tile has been marked.
    ///
    /// # Errors
    ///
    /// Returns [`BitmapError`] when the backing file cannot be read.
    pub fn has(&mut self, address: TileAddress) -> Result<bool, BitmapError> {
        let (byte, mask) = bit_position(address);
        let map = self.load(address.z)?;
        Ok(map[byte] & mask != 0)
    }

    /// Marks the tile. Marking twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BitmapError`] when the backing file cannot be read.
    pub fn set(&mut self, address: TileAddress) -> Result<(), BitmapError> {
        let (byte, mask) = bit_position(address);
        let map = self.load(address.z)?;
        if map[byte] & mask == 0 {
            map[byte] |= mask;
            self.dirty.insert(address.z);
        }
        Ok(())
    }

    /// Writes every modified bitmap to disk, creating the directory if needed.
    ///
    /// Each file is written to a temporary sibling and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns [`BitmapError::Io`] on the first failed write.
    pub fn flush(&mut self) -> Result<(), BitmapError> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(|source| BitmapError::Io {
            path: self.dir.clone(),
            source,
        })?;

        while let Some(z) = self.dirty.first().copied() {
            let path = self.file_path(z);
            if let Some(map) = self.maps.get(&z) {
                write_atomically(&path, map)?;
                debug!(zoom = z, path = %path.display(), "bitmap flushed");
            }
            self.dirty.remove(&z);
        }
        Ok(())
    }

    fn load(&mut self, z: u8) -> Result<&mut Vec<u8>, BitmapError> {
        match self.maps.entry(z) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let map = read_or_create(&self.dir, z)?;
                Ok(entry.insert(map))
            }
        }
    }
}

fn read_or_create(dir: &Path, z: u8) -> Result<Vec<u8>, BitmapError> {
    let expected = bitmap_len(z);
    let too_large = || BitmapError::TooLarge { z, bytes: expected };
    if expected > MAX_BITMAP_BYTES {
        return Err(too_large());
    }
    let len = usize::try_from(expected).map_err(|_| too_large())?;
    let path = dir.join(format!("z{z}.bit"));

    let mut bytes = match fs::read(&path) {
        Ok(bytes) => {
            if bytes.len() != len {
                warn!(
                    path = %path.display(),
                    actual = bytes.len(),
                    expected = len,
                    "bitmap has unexpected size, resizing"
                );
            }
            bytes
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(source) => return Err(BitmapError::Io { path, source }),
    };
    bytes.truncate(len);
    bytes
        .try_reserve_exact(len - bytes.len())
        .map_err(|_| too_large())?;
    bytes.resize(len, 0);
    Ok(bytes)
}

fn bit_position(address: TileAddress) -> (usize, u8) {
    let n = tiles_per_axis(address.z);
    let index = u64::from(address.y) * n + u64::from(address.x);
    // The bitmap for this zoom was sized with usize, so the byte index fits.
    #[allow(clippy::cast_possible_truncation)]
    let byte = (index >> 3) as usize;
    (byte, 1u8 << (index & 7))
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), BitmapError> {
    let tmp = path.with_extension("bit.tmp");
    fs::write(&tmp, bytes).map_err(|source| BitmapError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| BitmapError::Io {
        path: path.to_path_buf(),
        source,
    })
}
