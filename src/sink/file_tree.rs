//! File-tree sink: one file per tile under `<root>/<z>/<x>/<y>.<ext>`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::SinkError;
use crate::bitmap::ProgressBitmap;
use crate::tile::{TileAddress, TileRange};

/// Tile sink writing plain files and tracking progress in bitmaps.
///
/// Existence checks only consult the bitmap; tiles copied into the tree by
/// other means are fetched again.
#[derive(Debug)]
pub struct FileTreeSink {
    root: PathBuf,
    extension: String,
    bitmap: Mutex<ProgressBitmap>,
}

impl FileTreeSink {
    /// Creates a sink rooted at `root` writing `.<extension>` files.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, extension: &str) -> Self {
        let root = root.into();
        let bitmap = Mutex::new(ProgressBitmap::new(&root));
        Self {
            root,
            extension: extension.trim_start_matches('.').to_string(),
            bitmap,
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination path of one tile.
    #[must_use]
    pub fn tile_path(&self, address: TileAddress) -> PathBuf {
        self.root
            .join(address.z.to_string())
            .join(address.x.to_string())
            .join(format!("{}.{}", address.y, self.extension))
    }

    /// Whether the tile is marked as written.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Bitmap`] when the bitmap cannot be loaded.
    pub fn contains(&self, address: TileAddress) -> Result<bool, SinkError> {
        Ok(self.lock_bitmap().has(address)?)
    }

    /// Writes the tile file and marks it in the bitmap.
    ///
    /// The payload goes to a temporary sibling first so a crash never leaves
    /// a truncated tile at the final path.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] or [`SinkError::Bitmap`].
    pub async fn write(&self, address: TileAddress, data: &[u8]) -> Result<(), SinkError> {
        let path = self.tile_path(address);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SinkError::io(parent, source))?;
        }

        let tmp = path.with_extension(format!("{}.part", self.extension));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|source| SinkError::io(&tmp, source))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| SinkError::io(&path, source))?;

        self.lock_bitmap().set(address)?;
        debug!(tile = %address, path = %path.display(), "tile written");
        Ok(())
    }

    /// Rows of column `x` in `range` that are not marked yet.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Bitmap`] when the bitmap cannot be loaded.
    pub fn missing_in_column(
        &self,
        z: u8,
        x: u32,
        range: &TileRange,
    ) -> Result<Vec<u32>, SinkError> {
        let mut bitmap = self.lock_bitmap();
        let mut missing = Vec::new();
        for y in range.min_y..=range.max_y {
            if !bitmap.has(TileAddress { z, x, y })? {
                missing.push(y);
            }
        }
        Ok(missing)
    }

    /// Writes modified bitmaps to disk.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Bitmap`] on write failure.
    pub fn flush(&self) -> Result<(), SinkError> {
        Ok(self.lock_bitmap().flush()?)
    }

    fn lock_bitmap(&self) -> MutexGuard<'_, ProgressBitmap> {
        self.bitmap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
