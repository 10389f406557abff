//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use tilecrawler_core::{CrawlerOptions, SinkMode};

/// Crawl map tiles into a directory tree or an MBTiles file.
///
/// The source file names the tile service, the zoom levels and bounding
/// boxes to fetch, and the crawl options. Flags override the options.
#[derive(Parser, Debug)]
#[command(name = "tilecrawler")]
#[command(author, version, about)]
pub struct Args {
    /// Tile source definition (TOML)
    pub source: PathBuf,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Concurrent requests (1-1024)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u16).range(1..=1024))]
    pub concurrency: Option<u16>,

    /// Requeues per tile before it counts as failed
    #[arg(short = 'r', long)]
    pub max_retry: Option<u32>,

    /// Output sink
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Root directory of the `dir` sink
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Path of the `mbtiles` sink
    #[arg(long)]
    pub tile_store: Option<PathBuf>,

    /// Path of the checkpoint file
    #[arg(long)]
    pub progress_file: Option<PathBuf>,

    /// Only count stored tiles per level; exit non-zero when any are missing
    #[arg(long, conflicts_with = "repair_only")]
    pub check_only: bool,

    /// Only fetch tiles missing from the MBTiles file
    #[arg(long)]
    pub repair_only: bool,

    /// Do not move the resume cursor back to the first missing tile
    #[arg(long)]
    pub no_rollback: bool,
}

/// Sink selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// `<out-dir>/<z>/<x>/<y>.<ext>` files
    Dir,
    /// A single MBTiles database
    Mbtiles,
}

impl From<ModeArg> for SinkMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Dir => Self::FileTree,
            ModeArg::Mbtiles => Self::TileStore,
        }
    }
}

impl Args {
    /// Applies flag overrides on top of the options read from the source file.
    pub fn apply_overrides(&self, options: &mut CrawlerOptions) {
        if let Some(concurrency) = self.concurrency {
            options.concurrency = usize::from(concurrency);
        }
        if let Some(max_retry) = self.max_retry {
            options.max_retry = max_retry;
        }
        if let Some(mode) = self.mode {
            options.mode = mode.into();
        }
        if let Some(out_dir) = &self.out_dir {
            options.out_dir.clone_from(out_dir);
        }
        if let Some(tile_store) = &self.tile_store {
            options.tile_store_path.clone_from(tile_store);
        }
        if let Some(progress_file) = &self.progress_file {
            options.progress_file.clone_from(progress_file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_source() {
        let err = Args::try_parse_from(["tilecrawler"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_defaults_leave_options_untouched() {
        let args = Args::try_parse_from(["tilecrawler", "china.toml"]).unwrap();
        assert_eq!(args.source, PathBuf::from("china.toml"));
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(!args.check_only && !args.repair_only && !args.no_rollback);

        let mut options = CrawlerOptions::default();
        args.apply_overrides(&mut options);
        assert_eq!(options, CrawlerOptions::default());
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["tilecrawler", "s.toml", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_overrides_apply() {
        let args = Args::try_parse_from([
            "tilecrawler",
            "s.toml",
            "-c",
            "16",
            "-r",
            "2",
            "--mode",
            "dir",
            "--out-dir",
            "/data/tiles",
            "--tile-store",
            "/data/t.mbtiles",
            "--progress-file",
            "/data/p.json",
        ])
        .unwrap();

        let mut options = CrawlerOptions::default();
        args.apply_overrides(&mut options);
        assert_eq!(options.concurrency, 16);
        assert_eq!(options.max_retry, 2);
        assert_eq!(options.mode, SinkMode::FileTree);
        assert_eq!(options.out_dir, PathBuf::from("/data/tiles"));
        assert_eq!(options.tile_store_path, PathBuf::from("/data/t.mbtiles"));
        assert_eq!(options.progress_file, PathBuf::from("/data/p.json"));
    }

    #[test]
    fn test_cli_concurrency_range() {
        assert!(Args::try_parse_from(["tilecrawler", "s.toml", "-c", "0"]).is_err());
        assert!(Args::try_parse_from(["tilecrawler", "s.toml", "-c", "1025"]).is_err());
        assert!(Args::try_parse_from(["tilecrawler", "s.toml", "-c", "1024"]).is_ok());
    }

    #[test]
    fn test_cli_invalid_mode_rejected() {
        let err = Args::try_parse_from(["tilecrawler", "s.toml", "--mode", "zip"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn test_cli_check_only_conflicts_with_repair_only() {
        let err = Args::try_parse_from(["tilecrawler", "s.toml", "--check-only", "--repair-only"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["tilecrawler", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
