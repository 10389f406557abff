//! SQLite connection management for the MBTiles tile store.
//!
//! This module provides:
//! - Connection pool management
//! - WAL mode so integrity scans can read while workers insert
//! - Automatic migration of the `tiles` and `metadata` tables
//!
//! # Example
//!
//! ```no_run
//! use tilecrawler_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open(Path::new("tiles/tiles.mbtiles")).await?;
//! // Use db.pool() for queries...
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tracing::instrument;

/// Maximum number of pooled connections.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database or run a query.
    #[error("database error: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Failed to create the directory holding the database file.
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        /// The directory.
        path: std::path::PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Pooled connection to an MBTiles file.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `db_path`.
    ///
    /// This will:
    /// 1. Create the parent directory and the database file if missing
    /// 2. Enable WAL mode and a busy timeout on every connection
    /// 3. Run any pending migrations
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the directory, connection or migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DbError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// Uses a single connection that is never recycled, so every query sees
    /// the same database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checks if WAL mode is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the query fails.
    #[instrument(skip(self))]
    pub async fn is_wal_enabled(&self) -> Result<bool, DbError> {
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;

        Ok(result.0.eq_ignore_ascii_case("wal"))
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Gracefully closes all connections in the pool.
    ///
    /// Queries issued afterwards fail with a pool-closed error.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_new_in_memory_succeeds() {
        let db = Database::new_in_memory().await;
        assert!(db.is_ok(), "Failed to create in-memory database");
    }

    #[tokio::test]
    async fn test_database_tiles_table_exists() {
        let db = Database::new_in_memory().await.unwrap();

        let result = sqlx::query(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (0, 0, 0, x'00')",
        )
        .execute(db.pool())
        .await;

        assert!(result.is_ok(), "tiles table should exist after migration");
    }

    #[tokio::test]
    async fn test_database_tiles_primary_key_rejects_duplicates() {
        let db = Database::new_in_memory().await.unwrap();
        let insert = "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (1, 0, 1, x'00')";

        sqlx::query(insert).execute(db.pool()).await.unwrap();
        let duplicate = sqlx::query(insert).execute(db.pool()).await;

        assert!(duplicate.is_err(), "duplicate tile address should be rejected");
    }

    #[tokio::test]
    async fn test_database_metadata_name_is_unique() {
        let db = Database::new_in_memory().await.unwrap();
        sqlx::query("INSERT INTO metadata (name, value) VALUES ('format', 'png')")
            .execute(db.pool())
            .await
            .unwrap();
        let duplicate = sqlx::query("INSERT INTO metadata (name, value) VALUES ('format', 'jpg')")
            .execute(db.pool())
            .await;

        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_database_open_creates_parent_dir_and_enables_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested/tiles.mbtiles");

        let db = Database::open(&db_path).await.unwrap();
        assert!(db_path.exists());
        assert!(db.is_wal_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_database_close_works() {
        let db = Database::new_in_memory().await.unwrap();
        assert!(!db.is_closed());
        db.close().await;
        assert!(db.is_closed());
    }
}
