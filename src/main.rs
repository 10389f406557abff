//! CLI entry point for the tile crawler.

use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tilecrawler_core::{CrawlReport, ResumePlan, SourceConfig, TileCrawler, TileSource};
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "cli arguments parsed");

    let mut config = SourceConfig::load(&args.source)
        .with_context(|| format!("failed to load source file {}", args.source.display()))?;
    args.apply_overrides(&mut config.options);

    let source: Arc<dyn TileSource> = Arc::new(config.build_source()?);
    info!(
        source = %config.name,
        levels = config.levels.len(),
        mode = ?config.options.mode,
        "tilecrawler starting"
    );

    let crawler = TileCrawler::open(source, config.options.clone())
        .await
        .context("failed to open crawler")?;
    let levels = config.levels;

    if args.check_only {
        let report = crawler.integrity_report(&levels).await?;
        crawler.sink().close().await?;
        println!(
            "{} of {} tiles stored, {} missing",
            report.actual(),
            report.expected(),
            report.missing()
        );
        for level in report.incomplete_levels() {
            println!("  z{}: {} missing", level.z, level.missing());
        }
        return Ok(exit_code(!report.is_incomplete()));
    }

    if args.repair_only {
        let report = crawler.repair_missing_tiles(&levels, true).await?;
        println!(
            "repaired {} of {} missing tiles",
            report.repaired, report.missing
        );
        return Ok(exit_code(!report.interrupted && report.still_missing() == 0));
    }

    match crawler.prepare_resume(&levels, !args.no_rollback).await? {
        ResumePlan::Complete => {
            info!("all tiles present, nothing to crawl");
            crawler.sink().close().await?;
            return Ok(ExitCode::SUCCESS);
        }
        plan => debug!(?plan, "resume plan"),
    }

    let show_progress = !args.quiet && io::stderr().is_terminal();
    let progress = progress::spawn_progress_ui(show_progress, crawler.subscribe());

    let result = crawler.run(&levels).await;
    // The progress task ends once the crawler's channel sender is gone.
    drop(crawler);
    if let Some(handle) = progress
        && let Err(error) = handle.await
    {
        warn!(error = %error, "progress task failed");
    }

    let report = result?;
    print_summary(&report);
    Ok(exit_code(
        !report.interrupted && report.permanent_failures.is_empty(),
    ))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_summary(report: &CrawlReport) {
    let state = if report.interrupted {
        "interrupted"
    } else {
        "finished"
    };
    println!(
        "{state}: {}/{} tiles in {:.1}s (ok {}, skip {}, fail {})",
        report.done,
        report.total,
        report.elapsed.as_secs_f64(),
        report.totals.ok,
        report.totals.skip,
        report.totals.fail
    );
    if !report.permanent_failures.is_empty() {
        println!("{} tiles could not be fetched", report.permanent_failures.len());
    }
    if let Some(repair) = &report.repair {
        println!(
            "repair: {} of {} missing tiles fetched",
            repair.repaired, repair.missing
        );
    }
}
