//! Integrity check and missing-address scans.

use std::collections::HashSet;

use tracing::{info, instrument, warn};

use super::{CrawlerError, TileCrawler};
use crate::tile::{Level, TileAddress, compute_tile_range};

/// Stored versus expected tile counts of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelIntegrity {
    /// Zoom level.
    pub z: u8,
    /// Addresses in the level's range.
    pub expected: u64,
    /// Stored tiles inside the range.
    pub actual: u64,
}

impl LevelIntegrity {
    /// Tiles short of the expected count.
    #[must_use]
    pub fn missing(&self) -> u64 {
        self.expected.saturating_sub(self.actual)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.actual >= self.expected
    }
}

/// Per-level result of an integrity check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// One entry per configured level, in plan order.
    pub levels: Vec<LevelIntegrity>,
}

impl IntegrityReport {
    /// Whether any level is short.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.levels.iter().any(|l| !l.is_complete())
    }

    /// Levels that are short.
    pub fn incomplete_levels(&self) -> impl Iterator<Item = &LevelIntegrity> {
        self.levels.iter().filter(|l| !l.is_complete())
    }

    #[must_use]
    pub fn expected(&self) -> u64 {
        self.levels.iter().map(|l| l.expected).sum()
    }

    #[must_use]
    pub fn actual(&self) -> u64 {
        self.levels.iter().map(|l| l.actual).sum()
    }

    #[must_use]
    pub fn missing(&self) -> u64 {
        self.levels.iter().map(LevelIntegrity::missing).sum()
    }
}

impl TileCrawler {
    /// Counts stored tiles per level against the level ranges.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlerError::UnsupportedSink`] for the file-tree sink,
    /// [`CrawlerError::SinkClosed`] once the store is closed, and
    /// [`CrawlerError::Sink`] when a query fails.
    #[instrument(skip(self, levels), fields(levels = levels.len()))]
    pub async fn integrity_report(&self, levels: &[Level]) -> Result<IntegrityReport, CrawlerError> {
        let store = self.tile_store("integrity check")?;
        store.flush().await?;

        let mut report = IntegrityReport::default();
        for level in levels {
            let range = compute_tile_range(level);
            let entry = LevelIntegrity {
                z: level.z,
                expected: range.len(),
                actual: store.count_in_range(level.z, &range).await?,
            };
            if entry.is_complete() {
                info!(zoom = entry.z, expected = entry.expected, "level complete");
            } else {
                warn!(
                    zoom = entry.z,
                    expected = entry.expected,
                    actual = entry.actual,
                    missing = entry.missing(),
                    "level incomplete"
                );
            }
            report.levels.push(entry);
        }

        info!(
            expected = report.expected(),
            actual = report.actual(),
            missing = report.missing(),
            "integrity check finished"
        );
        Ok(report)
    }

    /// Whether any level of the tile store is missing tiles.
    ///
    /// # Errors
    ///
    /// Same as [`integrity_report`](Self::integrity_report).
    pub async fn check_integrity_by_levels(&self, levels: &[Level]) -> Result<bool, CrawlerError> {
        Ok(self.integrity_report(levels).await?.is_incomplete())
    }

    /// First address in generation order that the sink does not hold.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlerError::SinkClosed`] once the store is closed and
    /// [`CrawlerError::Sink`] when a lookup fails.
    #[instrument(skip(self, levels))]
    pub async fn find_first_missing_tile(
        &self,
        levels: &[Level],
    ) -> Result<Option<TileAddress>, CrawlerError> {
        self.ensure_open("missing-tile scan")?;
        for level in levels {
            let range = compute_tile_range(level);
            for x in range.min_x..=range.max_x {
                let missing = self.sink.missing_in_column(level.z, x, &range).await?;
                if let Some(&y) = missing.first() {
                    let address = TileAddress { z: level.z, x, y };
                    info!(tile = %address, "first missing tile");
                    return Ok(Some(address));
                }
            }
        }
        info!("no missing tiles");
        Ok(None)
    }

    /// Every address of the plan the sink does not hold, in generation order.
    pub(super) async fn missing_tiles(
        &self,
        levels: &[Level],
    ) -> Result<Vec<TileAddress>, CrawlerError> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for level in levels {
            let range = compute_tile_range(level);
            for x in range.min_x..=range.max_x {
                for y in self.sink.missing_in_column(level.z, x, &range).await? {
                    let address = TileAddress { z: level.z, x, y };
                    if seen.insert(address) {
                        missing.push(address);
                    }
                }
            }
        }
        Ok(missing)
    }
}
