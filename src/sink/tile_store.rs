//! MBTiles tile store with batched, insert-if-absent writes.
//!
//! Tiles are buffered in memory and written in one transaction once
//! `batch_size` rows are pending. A crash before a flush loses at most one
//! batch; resume and repair recover those addresses.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::SinkError;
use super::metadata::TileMetadata;
use crate::db::Database;
use crate::tile::{TileAddress, TileRange, tms_row_flip};

/// Default number of buffered tiles per transaction.
pub const DEFAULT_BATCH_SIZE: usize = 200;

#[derive(Debug)]
struct PendingTile {
    address: TileAddress,
    data: Vec<u8>,
}

/// Relational sink backed by an MBTiles database.
#[derive(Debug)]
pub struct TileStore {
    db: Database,
    pending: Mutex<Vec<PendingTile>>,
    batch_size: usize,
    closed: AtomicBool,
}

impl TileStore {
    /// Opens (creating if needed) the MBTiles file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Db`] when the database cannot be opened.
    pub async fn open(path: &Path, batch_size: usize) -> Result<Self, SinkError> {
        let db = Database::open(path).await?;
        info!(path = %path.display(), batch_size, "tile store opened");
        Ok(Self::from_database(db, batch_size))
    }

    /// Opens a throwaway in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Db`] when the database cannot be created.
    pub async fn in_memory(batch_size: usize) -> Result<Self, SinkError> {
        Ok(Self::from_database(
            Database::new_in_memory().await?,
            batch_size,
        ))
    }

    /// Wraps an already opened database.
    #[must_use]
    pub fn from_database(db: Database, batch_size: usize) -> Self {
        Self {
            db,
            pending: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size: batch_size.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Whether [`close`](Self::close) has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fails with [`SinkError::Closed`] once the store is closed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`].
    pub fn ensure_open(&self) -> Result<(), SinkError> {
        if self.is_closed() {
            Err(SinkError::Closed)
        } else {
            Ok(())
        }
    }

    /// Whether the tile is stored or waiting in the current batch.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store is closed or the query fails.
    pub async fn contains(&self, address: TileAddress) -> Result<bool, SinkError> {
        self.ensure_open()?;
        {
            let pending = self.pending.lock().await;
            if pending.iter().any(|t| t.address == address) {
                return Ok(true);
            }
        }

        let row: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM tiles WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
        )
        .bind(i64::from(address.z))
        .bind(i64::from(address.x))
        .bind(i64::from(address.tms_y()))
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Buffers a tile, flushing the batch once it is full.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store is closed or the flush fails. A
    /// failed batch stays buffered and is retried on the next flush.
    pub async fn insert(&self, address: TileAddress, data: Vec<u8>) -> Result<(), SinkError> {
        self.ensure_open()?;
        let mut pending = self.pending.lock().await;
        pending.push(PendingTile { address, data });
        if pending.len() >= self.batch_size {
            self.write_batch(&mut pending).await?;
        }
        Ok(())
    }

    /// Writes every buffered tile.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store is closed or the transaction fails.
    pub async fn flush(&self) -> Result<(), SinkError> {
        self.ensure_open()?;
        let mut pending = self.pending.lock().await;
        self.write_batch(&mut pending).await
    }

    /// Number of buffered tiles.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn write_batch(&self, pending: &mut Vec<PendingTile>) -> Result<(), SinkError> {
        if pending.is_empty() {
            return Ok(());
        }

        let mut tx = self.db.pool().begin().await?;
        for tile in pending.iter() {
            sqlx::query(
                "INSERT OR IGNORE INTO tiles (zoom_level, tile_column, tile_row, tile_data) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(i64::from(tile.address.z))
            .bind(i64::from(tile.address.x))
            .bind(i64::from(tile.address.tms_y()))
            .bind(tile.data.as_slice())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(rows = pending.len(), "batch committed");
        pending.clear();
        Ok(())
    }

    /// Number of stored tiles of zoom `z` inside `range`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store is closed or the query fails.
    pub async fn count_in_range(&self, z: u8, range: &TileRange) -> Result<u64, SinkError> {
        self.ensure_open()?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tiles WHERE zoom_level = ? \
             AND tile_column BETWEEN ? AND ? AND tile_row BETWEEN ? AND ?",
        )
        .bind(i64::from(z))
        .bind(i64::from(range.min_x))
        .bind(i64::from(range.max_x))
        .bind(i64::from(tms_row_flip(range.max_y, z)))
        .bind(i64::from(tms_row_flip(range.min_y, z)))
        .fetch_one(self.db.pool())
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// XYZ rows stored in column `x` of zoom `z`, limited to `range`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store is closed or the query fails.
    pub async fn rows_in_column(
        &self,
        z: u8,
        x: u32,
        range: &TileRange,
    ) -> Result<HashSet<u32>, SinkError> {
        self.ensure_open()?;
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT tile_row FROM tiles WHERE zoom_level = ? AND tile_column = ? \
             AND tile_row BETWEEN ? AND ?",
        )
        .bind(i64::from(z))
        .bind(i64::from(x))
        .bind(i64::from(tms_row_flip(range.max_y, z)))
        .bind(i64::from(tms_row_flip(range.min_y, z)))
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| u32::try_from(row).ok())
            .map(|tms| tms_row_flip(tms, z))
            .collect())
    }

    /// Total number of stored tiles.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store is closed or the query fails.
    pub async fn tile_count(&self) -> Result<u64, SinkError> {
        self.ensure_open()?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tiles")
            .fetch_one(self.db.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Stored payload of one tile.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store is closed or the query fails.
    pub async fn tile_data(&self, address: TileAddress) -> Result<Option<Vec<u8>>, SinkError> {
        self.ensure_open()?;
        let data = sqlx::query_scalar(
            "SELECT tile_data FROM tiles WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
        )
        .bind(i64::from(address.z))
        .bind(i64::from(address.x))
        .bind(i64::from(address.tms_y()))
        .fetch_optional(self.db.pool())
        .await?;
        Ok(data)
    }

    /// Replaces the metadata table.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store is closed or the transaction fails.
    #[instrument(skip(self, metadata), fields(name = %metadata.name))]
    pub async fn write_metadata(&self, metadata: &TileMetadata) -> Result<(), SinkError> {
        self.ensure_open()?;
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM metadata").execute(&mut *tx).await?;
        for (name, value) in metadata.to_pairs() {
            sqlx::query("INSERT INTO metadata (name, value) VALUES (?, ?)")
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!("metadata written");
        Ok(())
    }

    /// Current metadata table.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the store is closed or the query fails.
    pub async fn metadata(&self) -> Result<BTreeMap<String, String>, SinkError> {
        self.ensure_open()?;
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT name, value FROM metadata")
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows
            .into_iter()
            .map(|(name, value)| (name, value.unwrap_or_default()))
            .collect())
    }

    /// Flushes buffered tiles and closes the database.
    ///
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the final flush fails; the store stays open
    /// so the caller can retry.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), SinkError> {
        if self.is_closed() {
            return Ok(());
        }
        {
            let mut pending = self.pending.lock().await;
            self.write_batch(&mut pending).await?;
            self.closed.store(true, Ordering::SeqCst);
        }
        self.db.close().await;
        info!("tile store closed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tile::{BBox, Level, compute_tile_range};

    fn addr(z: u8, x: u32, y: u32) -> TileAddress {
        TileAddress { z, x, y }
    }

    // ==================== Batching ====================

    #[tokio::test]
    async fn test_insert_buffers_until_batch_full() {
        let store = TileStore::in_memory(3).await.unwrap();
        store.insert(addr(1, 0, 0), vec![1]).await.unwrap();
        store.insert(addr(1, 0, 1), vec![2]).await.unwrap();

        assert_eq!(store.pending_len().await, 2);
        assert_eq!(store.tile_count().await.unwrap(), 0);

        store.insert(addr(1, 1, 0), vec![3]).await.unwrap();
        assert_eq!(store.pending_len().await, 0);
        assert_eq!(store.tile_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_contains_sees_pending_and_stored_tiles() {
        let store = TileStore::in_memory(10).await.unwrap();
        store.insert(addr(2, 1, 3), vec![9]).await.unwrap();
        assert!(store.contains(addr(2, 1, 3)).await.unwrap());

        store.flush().await.unwrap();
        assert!(store.contains(addr(2, 1, 3)).await.unwrap());
        assert!(!store.contains(addr(2, 3, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first_payload() {
        let store = TileStore::in_memory(1).await.unwrap();
        store.insert(addr(0, 0, 0), vec![1]).await.unwrap();
        store.insert(addr(0, 0, 0), vec![2]).await.unwrap();

        assert_eq!(store.tile_count().await.unwrap(), 1);
        assert_eq!(store.tile_data(addr(0, 0, 0)).await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_rows_stored_in_tms_order() {
        let store = TileStore::in_memory(1).await.unwrap();
        store.insert(addr(2, 1, 0), vec![7]).await.unwrap();

        let row: (i64,) = sqlx::query_as("SELECT tile_row FROM tiles")
            .fetch_one(store.database().pool())
            .await
            .unwrap();
        assert_eq!(row.0, 3);
    }

    // ==================== Range queries ====================

    #[tokio::test]
    async fn test_count_in_range_translates_rows() {
        let store = TileStore::in_memory(100).await.unwrap();
        for x in 0..4 {
            for y in 0..4 {
                store.insert(addr(2, x, y), vec![0]).await.unwrap();
            }
        }
        store.flush().await.unwrap();

        let range = TileRange {
            min_x: 1,
            max_x: 2,
            min_y: 0,
            max_y: 1,
        };
        assert_eq!(store.count_in_range(2, &range).await.unwrap(), 4);
        assert_eq!(
            store.count_in_range(2, &TileRange::full(2)).await.unwrap(),
            16
        );
    }

    #[tokio::test]
    async fn test_rows_in_column_returns_xyz_rows() {
        let store = TileStore::in_memory(100).await.unwrap();
        store.insert(addr(3, 5, 1), vec![0]).await.unwrap();
        store.insert(addr(3, 5, 6), vec![0]).await.unwrap();
        store.insert(addr(3, 4, 2), vec![0]).await.unwrap();
        store.flush().await.unwrap();

        let rows = store
            .rows_in_column(3, 5, &TileRange::full(3))
            .await
            .unwrap();
        assert_eq!(rows, HashSet::from([1, 6]));

        let clipped = TileRange {
            min_x: 0,
            max_x: 7,
            min_y: 0,
            max_y: 3,
        };
        let rows = store.rows_in_column(3, 5, &clipped).await.unwrap();
        assert_eq!(rows, HashSet::from([1]));
    }

    #[tokio::test]
    async fn test_count_in_bbox_range() {
        let store = TileStore::in_memory(100).await.unwrap();
        let level = Level::clipped(4, BBox::new(100.0, 20.0, 120.0, 40.0));
        let range = compute_tile_range(&level);
        for x in range.min_x..=range.max_x {
            for y in range.min_y..=range.max_y {
                store.insert(addr(4, x, y), vec![0]).await.unwrap();
            }
        }
        store.insert(addr(4, 0, 0), vec![0]).await.unwrap();
        store.flush().await.unwrap();

        assert_eq!(store.count_in_range(4, &range).await.unwrap(), range.len());
    }

    // ==================== Metadata and lifecycle ====================

    #[tokio::test]
    async fn test_write_metadata_replaces_table() {
        let store = TileStore::in_memory(10).await.unwrap();
        let meta = TileMetadata::from_levels("first", "png", &[Level::full(1)]).unwrap();
        store.write_metadata(&meta).await.unwrap();
        let meta = TileMetadata::from_levels("second", "jpg", &[Level::full(2)]).unwrap();
        store.write_metadata(&meta).await.unwrap();

        let table = store.metadata().await.unwrap();
        assert_eq!(table["name"], "second");
        assert_eq!(table["format"], "jpg");
        assert_eq!(table["minzoom"], "2");
        assert_eq!(table.len(), 7);
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects_further_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.mbtiles");
        let store = TileStore::open(&path, 50).await.unwrap();
        store.insert(addr(1, 1, 1), vec![4]).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(
            store.insert(addr(1, 0, 0), vec![]).await,
            Err(SinkError::Closed)
        ));
        assert!(matches!(
            store.contains(addr(1, 1, 1)).await,
            Err(SinkError::Closed)
        ));

        let reopened = TileStore::open(&path, 50).await.unwrap();
        assert!(reopened.contains(addr(1, 1, 1)).await.unwrap());
    }
}
