//! Durable destinations for tile payloads.
//!
//! - [`FileTreeSink`] writes `<root>/<z>/<x>/<y>.<ext>` files and tracks
//!   progress in per-zoom bitmaps.
//! - [`TileStore`] writes an MBTiles database in buffered transactions.
//!
//! Both are idempotent: rewriting a tile never duplicates or replaces data
//! that is already stored.

mod file_tree;
mod metadata;
mod tile_store;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bitmap::BitmapError;
use crate::db::DbError;
use crate::tile::{TileAddress, TileRange};

pub use file_tree::FileTreeSink;
pub use metadata::{LayerType, TileMetadata};
pub use tile_store::{DEFAULT_BATCH_SIZE, TileStore};

/// Errors raised by sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Opening the tile store failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// A tile store query or transaction failed.
    #[error("tile store query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Writing a tile file failed.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Loading or flushing a progress bitmap failed.
    #[error(transparent)]
    Bitmap(#[from] BitmapError),

    /// The tile store was used after being closed.
    #[error("tile store is closed")]
    Closed,
}

impl SinkError {
    /// Creates an IO error.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Which sink a crawl writes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SinkMode {
    /// Plain files in a directory tree.
    #[serde(rename = "dir")]
    FileTree,
    /// An MBTiles database.
    #[default]
    #[serde(rename = "mbtiles")]
    TileStore,
}

impl fmt::Display for SinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FileTree => "dir",
            Self::TileStore => "mbtiles",
        })
    }
}

/// The sink opened for a crawl.
#[derive(Debug)]
pub enum TileSink {
    /// File tree with progress bitmaps.
    FileTree(FileTreeSink),
    /// MBTiles database.
    TileStore(TileStore),
}

impl TileSink {
    /// Which kind of sink this is.
    #[must_use]
    pub fn mode(&self) -> SinkMode {
        match self {
            Self::FileTree(_) => SinkMode::FileTree,
            Self::TileStore(_) => SinkMode::TileStore,
        }
    }

    /// The tile store, when this sink is one.
    #[must_use]
    pub fn as_tile_store(&self) -> Option<&TileStore> {
        match self {
            Self::TileStore(store) => Some(store),
            Self::FileTree(_) => None,
        }
    }

    /// Whether the tile is already materialized.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the lookup fails.
    pub async fn contains(&self, address: TileAddress) -> Result<bool, SinkError> {
        match self {
            Self::FileTree(sink) => sink.contains(address),
            Self::TileStore(store) => store.contains(address).await,
        }
    }

    /// Stores one tile.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the write fails.
    pub async fn write(&self, address: TileAddress, data: Vec<u8>) -> Result<(), SinkError> {
        match self {
            Self::FileTree(sink) => sink.write(address, &data).await,
            Self::TileStore(store) => store.insert(address, data).await,
        }
    }

    /// XYZ rows of column `x` in `range` that are not materialized.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the lookup fails.
    pub async fn missing_in_column(
        &self,
        z: u8,
        x: u32,
        range: &TileRange,
    ) -> Result<Vec<u32>, SinkError> {
        match self {
            Self::FileTree(sink) => sink.missing_in_column(z, x, range),
            Self::TileStore(store) => {
                store.flush().await?;
                let present: HashSet<u32> = store.rows_in_column(z, x, range).await?;
                Ok((range.min_y..=range.max_y)
                    .filter(|y| !present.contains(y))
                    .collect())
            }
        }
    }

    /// Makes every accepted write durable.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the flush fails.
    pub async fn flush(&self) -> Result<(), SinkError> {
        match self {
            Self::FileTree(sink) => sink.flush(),
            Self::TileStore(store) => store.flush().await,
        }
    }

    /// Flushes and releases the sink. The file tree stays usable.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the final flush fails.
    pub async fn close(&self) -> Result<(), SinkError> {
        match self {
            Self::FileTree(sink) => sink.flush(),
            Self::TileStore(store) => store.close().await,
        }
    }

    /// Whether the sink can still accept writes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        match self {
            Self::FileTree(_) => true,
            Self::TileStore(store) => !store.is_closed(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_in_column_tile_store_includes_pending() {
        let sink = TileSink::TileStore(TileStore::in_memory(100).await.unwrap());
        sink.write(TileAddress { z: 1, x: 0, y: 1 }, vec![1])
            .await
            .unwrap();

        let missing = sink
            .missing_in_column(1, 0, &TileRange::full(1))
            .await
            .unwrap();
        assert_eq!(missing, vec![0]);
    }

    #[tokio::test]
    async fn test_close_tile_store_marks_not_open() {
        let sink = TileSink::TileStore(TileStore::in_memory(10).await.unwrap());
        assert!(sink.is_open());
        sink.close().await.unwrap();
        assert!(!sink.is_open());
        assert!(matches!(
            sink.contains(TileAddress { z: 0, x: 0, y: 0 }).await,
            Err(SinkError::Closed)
        ));
    }

    #[test]
    fn test_sink_mode_serde_names() {
        let mode: SinkMode = serde_json::from_str("\"dir\"").unwrap();
        assert_eq!(mode, SinkMode::FileTree);
        assert_eq!(
            serde_json::to_string(&SinkMode::TileStore).unwrap(),
            "\"mbtiles\""
        );
        assert_eq!(SinkMode::default(), SinkMode::TileStore);
    }
}
