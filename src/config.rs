//! Crawl options and TOML tile-source definitions.
//!
//! A source file describes one tile service and the plan to crawl from it:
//!
//! ```toml
//! name = "MSN Street Map China"
//! url = "https://dynamic.{s}.tiles.example.com/comp/ch/{q}?it=G"
//! subdomains = ["t0", "t1", "t2", "t3"]
//! format = "png"
//! layer_type = "baselayer"
//!
//! [headers]
//! Referer = "https://www.example.com/"
//!
//! [[levels]]
//! z = 13
//! bbox = [73.0, 3.0, 135.0, 54.0]
//!
//! [options]
//! mode = "mbtiles"
//! concurrency = 256
//! tile_store_path = "./output/china.mbtiles"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::rate_limiter::{
    DEFAULT_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY, DEFAULT_PACING_WINDOW,
};
use crate::download::{CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, DelayConfig, READ_TIMEOUT_SECS};
use crate::sink::{DEFAULT_BATCH_SIZE, LayerType, SinkMode};
use crate::source::{SourceError, TemplateSource, TileFormat};
use crate::stats::DEFAULT_STATS_WINDOW;
use crate::tile::{Level, TileError};

/// Default number of concurrent fetches.
pub const DEFAULT_CONCURRENCY: usize = 128;

/// Upper bound accepted for `concurrency`.
pub const MAX_CONCURRENCY: usize = 1024;

/// Default size of the repair worker pool.
pub const DEFAULT_REPAIR_WORKERS: usize = 10;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The source file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// The file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The source file is not valid TOML for this schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// The file.
        path: PathBuf,
        /// The parser error.
        #[source]
        source: toml::de::Error,
    },

    /// A numeric option is out of range.
    #[error("invalid config value for `{field}`: {value}. Expected {expected}")]
    Invalid {
        /// Option name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted range or rule.
        expected: &'static str,
    },

    /// The plan has no levels.
    #[error("source defines no levels")]
    NoLevels,

    /// A level is malformed.
    #[error("invalid level #{index}: {source}")]
    Level {
        /// Position in the `levels` list.
        index: usize,
        /// What is wrong.
        #[source]
        source: TileError,
    },

    /// The URL template or headers are malformed.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Runtime knobs of a crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrawlerOptions {
    /// Which sink to write.
    pub mode: SinkMode,
    /// Concurrent fetches in the main pass.
    pub concurrency: usize,
    /// Requeues allowed per address before it counts as permanently failed.
    pub max_retry: u32,
    /// Base delay after each attempt, in milliseconds.
    pub delay_ms: u64,
    /// Lower bound of the adaptive delay, in milliseconds.
    pub min_delay_ms: u64,
    /// Upper bound of the adaptive delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Outcomes considered by the adaptive delay.
    pub window: usize,
    /// Outcomes considered by progress statistics.
    pub stats_window: usize,
    /// Tiles per tile-store transaction.
    pub batch_size: usize,
    /// Root of the file-tree sink.
    pub out_dir: PathBuf,
    /// Path of the MBTiles file.
    pub tile_store_path: PathBuf,
    /// Path of the checkpoint record.
    pub progress_file: PathBuf,
    /// Concurrent fetches in the repair pass.
    pub repair_workers: usize,
    /// Completed addresses between periodic checkpoints.
    pub checkpoint_every: u64,
    /// Maximum seconds between periodic checkpoints.
    pub checkpoint_interval_secs: u64,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP request timeout in seconds.
    pub read_timeout_secs: u64,
}

#[allow(clippy::cast_possible_truncation)]
fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            mode: SinkMode::default(),
            concurrency: DEFAULT_CONCURRENCY,
            max_retry: DEFAULT_MAX_RETRIES,
            delay_ms: millis(DEFAULT_DELAY),
            min_delay_ms: millis(DEFAULT_MIN_DELAY),
            max_delay_ms: millis(DEFAULT_MAX_DELAY),
            window: DEFAULT_PACING_WINDOW,
            stats_window: DEFAULT_STATS_WINDOW,
            batch_size: DEFAULT_BATCH_SIZE,
            out_dir: PathBuf::from("./tiles"),
            tile_store_path: PathBuf::from("./tiles/tiles.mbtiles"),
            progress_file: PathBuf::from("./tiles/progress.json"),
            repair_workers: DEFAULT_REPAIR_WORKERS,
            checkpoint_every: 1000,
            checkpoint_interval_secs: 30,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
        }
    }
}

impl CrawlerOptions {
    /// Validates option values and their relations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(invalid("concurrency", self.concurrency, "1..=1024"));
        }
        for (field, value) in [
            ("window", self.window),
            ("stats_window", self.stats_window),
            ("batch_size", self.batch_size),
            ("repair_workers", self.repair_workers),
        ] {
            if value == 0 {
                return Err(invalid(field, value, "a positive number"));
            }
        }
        if self.checkpoint_every == 0 {
            return Err(invalid("checkpoint_every", 0, "a positive number"));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(invalid(
                "min_delay_ms",
                self.min_delay_ms,
                "a value not above max_delay_ms",
            ));
        }
        if !(self.min_delay_ms..=self.max_delay_ms).contains(&self.delay_ms) {
            return Err(invalid(
                "delay_ms",
                self.delay_ms,
                "a value within [min_delay_ms, max_delay_ms]",
            ));
        }
        for (field, value) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
        ] {
            if !(1..=3600).contains(&value) {
                return Err(invalid(field, value, "1..=3600"));
            }
        }
        Ok(())
    }

    /// Pacing parameters for the rate limiter.
    #[must_use]
    pub fn delay_config(&self) -> DelayConfig {
        DelayConfig {
            base: Duration::from_millis(self.delay_ms),
            min: Duration::from_millis(self.min_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
            window: self.window,
        }
    }

    /// Maximum time between periodic checkpoints.
    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Completions between progress snapshots.
    #[must_use]
    pub fn progress_every(&self) -> u64 {
        u64::try_from(self.concurrency / 10).unwrap_or(u64::MAX).max(1)
    }
}

fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        field,
        value: value.to_string(),
        expected,
    }
}

/// A tile service plus the plan to crawl from it, as read from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Display and tileset name.
    pub name: String,
    /// URL template, see [`TemplateSource`].
    pub url: String,
    /// Values substituted for `{s}`.
    #[serde(default)]
    pub subdomains: Vec<String>,
    /// Payload format.
    #[serde(default)]
    pub format: TileFormat,
    /// Headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// MBTiles layer type.
    #[serde(default)]
    pub layer_type: LayerType,
    /// MBTiles attribution.
    pub attribution: Option<String>,
    /// Crawl plan in generation order.
    #[serde(default)]
    pub levels: Vec<Level>,
    /// Runtime options.
    #[serde(default)]
    pub options: CrawlerOptions,
}

impl SourceConfig {
    /// Reads and validates a source file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is unreadable, unparsable or
    /// invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates source TOML held in memory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the text is unparsable or invalid.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates levels, options and the tile source.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.levels.is_empty() {
            return Err(ConfigError::NoLevels);
        }
        for (index, level) in self.levels.iter().enumerate() {
            level
                .validate()
                .map_err(|source| ConfigError::Level { index, source })?;
        }
        self.options.validate()?;
        self.build_source()?;
        Ok(())
    }

    /// Builds the tile source described by this file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Source`] for malformed templates or headers.
    pub fn build_source(&self) -> Result<TemplateSource, ConfigError> {
        let mut source = TemplateSource::new(&self.name, &self.url, self.format)?
            .with_subdomains(self.subdomains.iter().cloned())
            .with_layer_type(self.layer_type);
        if let Some(attribution) = &self.attribution {
            source = source.with_attribution(attribution);
        }
        for (name, value) in &self.headers {
            source = source.with_header(name, value)?;
        }
        source.validate()?;
        Ok(source)
    }
}
