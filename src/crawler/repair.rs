//! Repair pass: fetch every address the tile store is missing.
//!
//! Missing addresses are collected up front. A fixed pool then pulls the next
//! index as soon as it finishes a task; a failed fetch is not retried and the
//! address stays missing for a later repair.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::progress::{CrawlPhase, ProgressSnapshot};
use super::worker::Fetcher;
use super::{CrawlerError, TileCrawler};
use crate::sink::TileSink;
use crate::stats::Outcome;
use crate::tile::{Level, TileAddress};

/// Result of a repair pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Addresses found missing.
    pub missing: usize,
    /// Addresses fetched and stored.
    pub repaired: usize,
    /// Whether the pass stopped early.
    pub interrupted: bool,
}

impl RepairReport {
    /// Addresses still missing after the pass.
    #[must_use]
    pub fn still_missing(&self) -> usize {
        self.missing.saturating_sub(self.repaired)
    }
}

impl TileCrawler {
    /// Re-scans the plan and fetches every missing tile, then flushes,
    /// rewrites metadata and closes the store.
    ///
    /// With `listen_for_interrupt`, Ctrl-C stops the pool for the duration
    /// of this call; the store is still flushed and closed.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlerError::UnsupportedSink`] for the file-tree sink,
    /// [`CrawlerError::SinkClosed`] once the store is closed, and
    /// [`CrawlerError::Sink`] when a scan, flush or close fails.
    pub async fn repair_missing_tiles(
        &self,
        levels: &[Level],
        listen_for_interrupt: bool,
    ) -> Result<RepairReport, CrawlerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let listener = listen_for_interrupt.then(|| super::spawn_interrupt_listener(&stop));
        let result = self.repair_interruptible(levels, stop).await;
        if let Some(listener) = listener {
            listener.abort();
        }
        result
    }

    /// Repair pass observing an external stop flag.
    ///
    /// # Errors
    ///
    /// Same as [`repair_missing_tiles`](Self::repair_missing_tiles).
    #[instrument(skip(self, levels, stop), fields(levels = levels.len()))]
    pub async fn repair_interruptible(
        &self,
        levels: &[Level],
        stop: Arc<AtomicBool>,
    ) -> Result<RepairReport, CrawlerError> {
        self.tile_store("repair")?;

        let missing = Arc::new(self.missing_tiles(levels).await?);
        let total = missing.len();
        info!(missing = total, workers = self.options.repair_workers, "repair started");
        self.publish(ProgressSnapshot {
            phase: CrawlPhase::Repairing,
            total: total as u64,
            ..ProgressSnapshot::default()
        });

        let next = Arc::new(AtomicUsize::new(0));
        let repaired = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..self.options.repair_workers.min(total))
            .map(|id| {
                let worker = RepairWorker {
                    fetcher: self.fetcher.clone(),
                    sink: Arc::clone(&self.sink),
                    missing: Arc::clone(&missing),
                    next: Arc::clone(&next),
                    repaired: Arc::clone(&repaired),
                    progress: Arc::clone(&self.progress),
                    stop: Arc::clone(&stop),
                };
                tokio::spawn(worker.run(id))
            })
            .collect();
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "repair worker panicked");
            }
        }

        let interrupted = stop.load(Ordering::SeqCst);
        let report = RepairReport {
            missing: total,
            repaired: usize::try_from(repaired.load(Ordering::SeqCst)).unwrap_or(usize::MAX),
            interrupted,
        };

        self.sink.flush().await?;
        if !interrupted {
            self.write_metadata(levels).await?;
        }
        self.sink.close().await?;

        if report.still_missing() > 0 {
            warn!(
                repaired = report.repaired,
                still_missing = report.still_missing(),
                interrupted,
                "repair left tiles missing"
            );
        } else {
            info!(repaired = report.repaired, "repair finished");
        }
        Ok(report)
    }
}

struct RepairWorker {
    fetcher: Fetcher,
    sink: Arc<TileSink>,
    missing: Arc<Vec<TileAddress>>,
    next: Arc<AtomicUsize>,
    repaired: Arc<AtomicU64>,
    progress: Arc<watch::Sender<ProgressSnapshot>>,
    stop: Arc<AtomicBool>,
}

impl RepairWorker {
    async fn run(self, id: usize) {
        while !self.stop.load(Ordering::SeqCst) {
            let index = self.next.fetch_add(1, Ordering::SeqCst);
            let Some(&address) = self.missing.get(index) else {
                break;
            };
            if self.fetcher.fetch_into(&self.sink, address).await == Outcome::Ok {
                self.repaired.fetch_add(1, Ordering::SeqCst);
                self.progress.send_modify(|snapshot| snapshot.done += 1);
            }
        }
        debug!(worker = id, "repair worker exited");
    }
}
