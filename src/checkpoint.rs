//! Durable crawl checkpoint: a resume cursor plus addresses still owed.
//!
//! The record is pretty-printed JSON:
//!
//! ```json
//! { "cursor": { "z": 12, "x": 3301, "y": 1554 }, "failed": [] }
//! ```
//!
//! A `cursor` means every address strictly before it in generation order is
//! done. Loading never fails: a missing record is a fresh start, a malformed
//! one is logged and treated as missing.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::tile::TileAddress;

/// Errors raised while saving a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Writing the record failed.
    #[error("failed to write checkpoint {path}: {source}")]
    Io {
        /// The file being written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Serializing the record failed.
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Resume state persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// First address not known to be done, in generation order.
    pub cursor: Option<TileAddress>,
    /// Addresses that were pulled but never stored.
    #[serde(default)]
    pub failed: Vec<TileAddress>,
}

impl Checkpoint {
    /// A record signalling a clean completion.
    #[must_use]
    pub fn cleared() -> Self {
        Self::default()
    }

    /// Whether this record carries no resume information.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.cursor.is_none() && self.failed.is_empty()
    }
}

/// File-backed checkpoint store.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Creates a store backed by `path`. The file is not touched until used.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the record, falling back to a fresh state on any problem.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self) -> Checkpoint {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no checkpoint found, starting fresh");
                return Checkpoint::default();
            }
            Err(error) => {
                warn!(error = %error, "checkpoint unreadable, starting fresh");
                return Checkpoint::default();
            }
        };

        let checkpoint: Checkpoint = match serde_json::from_slice(&bytes) {
            Ok(checkpoint) => checkpoint,
            Err(error) => {
                warn!(error = %error, "checkpoint malformed, starting fresh");
                return Checkpoint::default();
            }
        };

        if let Some(cursor) = checkpoint.cursor
            && let Err(error) = cursor.validate()
        {
            warn!(error = %error, "checkpoint cursor invalid, starting fresh");
            return Checkpoint::default();
        }

        let total = checkpoint.failed.len();
        let failed: Vec<_> = checkpoint
            .failed
            .into_iter()
            .filter(|a| a.validate().is_ok())
            .collect();
        if failed.len() != total {
            warn!(
                dropped = total - failed.len(),
                "checkpoint listed invalid failed addresses"
            );
        }

        Checkpoint {
            cursor: checkpoint.cursor,
            failed,
        }
    }

    /// Persists the record, replacing any previous one.
    ///
    /// The record is written to a temporary sibling and renamed into place,
    /// so readers see either the old or the new record.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] when serialization or IO fails.
    #[instrument(skip(self, checkpoint), fields(cursor = ?checkpoint.cursor, failed = checkpoint.failed.len()))]
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| CheckpointError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| CheckpointError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| CheckpointError::Io {
                path: self.path.clone(),
                source,
            })?;

        debug!("checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn addr(z: u8, x: u32, y: u32) -> TileAddress {
        TileAddress { z, x, y }
    }

    #[tokio::test]
    async fn test_load_missing_file_is_fresh() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("progress.json"));
        assert_eq!(store.load().await, Checkpoint::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested/progress.json"));
        let checkpoint = Checkpoint {
            cursor: Some(addr(3, 2, 1)),
            failed: vec![addr(1, 0, 0), addr(2, 3, 3)],
        };

        store.save(&checkpoint).await.unwrap();
        assert_eq!(store.load().await, checkpoint);
    }

    #[tokio::test]
    async fn test_record_format() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("progress.json"));
        store
            .save(&Checkpoint {
                cursor: Some(addr(1, 1, 0)),
                failed: vec![],
            })
            .await
            .unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "cursor": { "z": 1, "x": 1, "y": 0 }, "failed": [] })
        );
        assert!(text.contains('\n'), "record should be pretty-printed");
    }

    #[tokio::test]
    async fn test_malformed_record_is_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = CheckpointStore::new(&path);
        assert_eq!(store.load().await, Checkpoint::default());
    }

    #[tokio::test]
    async fn test_out_of_range_cursor_is_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, br#"{"cursor":{"z":1,"x":5,"y":0},"failed":[]}"#).unwrap();

        let store = CheckpointStore::new(&path);
        assert_eq!(store.load().await, Checkpoint::default());
    }

    #[tokio::test]
    async fn test_missing_failed_field_defaults_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, br#"{"cursor":null}"#).unwrap();

        let store = CheckpointStore::new(&path);
        assert!(store.load().await.is_cleared());
    }

    #[tokio::test]
    async fn test_cleared_overwrites_previous() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("progress.json"));
        store
            .save(&Checkpoint {
                cursor: Some(addr(2, 1, 1)),
                failed: vec![addr(2, 0, 0)],
            })
            .await
            .unwrap();
        store.save(&Checkpoint::cleared()).await.unwrap();

        assert!(store.load().await.is_cleared());
    }
}
