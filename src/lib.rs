//! Tilecrawler Core Library
//!
//! Crawls slippy-map tiles from a tile service into a local file tree or an
//! MBTiles database, with resumable checkpoints, adaptive pacing, integrity
//! checks and a repair pass.
//!
//! # Architecture
//!
//! - [`tile`] - Tile addresses, range math and the generation order
//! - [`bitmap`] - Per-zoom progress bitmaps for the file-tree sink
//! - [`checkpoint`] - Durable resume cursor and owed addresses
//! - [`stats`] - Sliding-window outcome statistics
//! - [`download`] - HTTP client, adaptive rate limiter and retry policy
//! - [`db`] - `SQLite` connection and schema management
//! - [`sink`] - File-tree and MBTiles sinks
//! - [`source`] - Tile source trait and the URL-template source
//! - [`config`] - Crawl options and TOML source files
//! - [`crawler`] - The orchestrator tying everything together

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bitmap;
pub mod checkpoint;
pub mod config;
pub mod crawler;
pub mod db;
pub mod download;
pub mod sink;
pub mod source;
pub mod stats;
pub mod tile;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{ConfigError, CrawlerOptions, SourceConfig};
pub use crawler::{
    CrawlPhase, CrawlReport, CrawlerError, IntegrityReport, LevelIntegrity, ProgressSnapshot,
    RepairReport, ResumePlan, TileCrawler,
};
pub use db::Database;
pub use download::{DownloadError, HttpClient, RateLimiter, RetryPolicy};
pub use sink::{FileTreeSink, SinkError, SinkMode, TileSink, TileStore};
pub use source::{TemplateSource, TileFormat, TileSource};
pub use stats::{Outcome, RuntimeStats};
pub use tile::{BBox, Level, TileAddress, TileRange, TileWalker};
