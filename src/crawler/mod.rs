//! Crawl orchestration.
//!
//! A [`TileCrawler`] drives one tile source into one sink:
//!
//! 1. `concurrency` workers share a lazy [`TileWalker`] and a retry queue;
//!    retries are pulled before fresh addresses.
//! 2. Addresses already in the sink are skipped without a request.
//! 3. Failures are requeued up to `max_retry` times, then moved to the
//!    permanent-failure list, which gets one sequential pass at the end.
//! 4. For the tile store the run then writes metadata, checks integrity and
//!    repairs gaps before closing; the file tree flushes its bitmaps.
//! 5. A cleared checkpoint marks completion.
//!
//! An interrupt stops the workers at their next pull; the crawler then saves
//! a checkpoint with the current cursor and every owed address, flushes and
//! closes the sink.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tilecrawler_core::{CrawlerOptions, Level, TemplateSource, TileCrawler, TileFormat};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = TemplateSource::new("osm", "https://tile.example.com/{z}/{x}/{y}.png", TileFormat::Png)?;
//! let crawler = TileCrawler::open(Arc::new(source), CrawlerOptions::default()).await?;
//! let report = crawler.run(&[Level::full(0), Level::full(3)]).await?;
//! println!("{} tiles stored", report.totals.ok);
//! # Ok(())
//! # }
//! ```

mod integrity;
mod progress;
mod repair;
mod state;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::config::{ConfigError, CrawlerOptions};
use crate::download::{DownloadError, HttpClient};
use crate::sink::{FileTreeSink, SinkError, SinkMode, TileSink, TileStore};
use crate::source::TileSource;
use crate::stats::{Outcome, OutcomeTotals};
use crate::tile::{Level, TileAddress, TileWalker, plan_index, plan_len};

pub use integrity::{IntegrityReport, LevelIntegrity};
pub use progress::{CrawlPhase, ProgressSnapshot};
pub use repair::RepairReport;

use state::{CrawlState, lock};
use worker::{Fetcher, Worker};

/// Errors that abort a crawler operation.
///
/// Fetch failures never appear here; they are counted as outcomes.
#[derive(Debug, Error)]
pub enum CrawlerError {
    /// The operation needs the MBTiles sink.
    #[error("{operation} is only supported for the mbtiles sink")]
    UnsupportedSink {
        /// Operation name.
        operation: &'static str,
    },

    /// The tile store was closed by an earlier run or repair.
    #[error("{operation} needs an open tile store")]
    SinkClosed {
        /// Operation name.
        operation: &'static str,
    },

    /// Invalid options.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The HTTP client could not be built.
    #[error(transparent)]
    Client(#[from] DownloadError),

    /// A sink operation failed.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The checkpoint could not be saved.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Summary of a [`TileCrawler::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlReport {
    /// Attempt outcomes of this run, including the final pass.
    pub totals: OutcomeTotals,
    /// Addresses done, counting those before the resume cursor.
    pub done: u64,
    /// Addresses in the plan.
    pub total: u64,
    /// Addresses that were never stored.
    pub permanent_failures: Vec<TileAddress>,
    /// Whether the run stopped early.
    pub interrupted: bool,
    /// Integrity check result (tile store only).
    pub integrity: Option<IntegrityReport>,
    /// Automatic repair result (tile store only, when gaps were found).
    pub repair: Option<RepairReport>,
    /// Wall time of the run.
    pub elapsed: Duration,
}

/// Where a crawl will start, decided before [`TileCrawler::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePlan {
    /// No checkpoint cursor; start from the first address.
    Fresh,
    /// Continue from the saved cursor.
    FromCheckpoint {
        /// Saved cursor.
        cursor: TileAddress,
    },
    /// The cursor was set just before the first gap in the sink.
    RolledBack {
        /// First address the sink does not hold.
        first_missing: TileAddress,
        /// Cursor now saved in the checkpoint.
        cursor: TileAddress,
    },
    /// Every address of the plan is already stored.
    Complete,
}

/// Orchestrates a crawl of one source into one sink.
pub struct TileCrawler {
    source: Arc<dyn TileSource>,
    sink: Arc<TileSink>,
    fetcher: Fetcher,
    options: CrawlerOptions,
    checkpoints: Arc<CheckpointStore>,
    progress: Arc<watch::Sender<ProgressSnapshot>>,
}

impl TileCrawler {
    /// Validates `options` and opens the sink they select.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlerError::Config`] for invalid options,
    /// [`CrawlerError::Sink`] when the tile store cannot be opened and
    /// [`CrawlerError::Client`] when the HTTP client cannot be built.
    pub async fn open(
        source: Arc<dyn TileSource>,
        options: CrawlerOptions,
    ) -> Result<Self, CrawlerError> {
        options.validate()?;
        let sink = match options.mode {
            SinkMode::FileTree => TileSink::FileTree(FileTreeSink::new(
                &options.out_dir,
                source.file_extension(),
            )),
            SinkMode::TileStore => TileSink::TileStore(
                TileStore::open(&options.tile_store_path, options.batch_size).await?,
            ),
        };
        Self::with_sink(source, sink, options)
    }

    /// Uses an already opened sink; `options.mode` is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlerError::Config`] or [`CrawlerError::Client`].
    pub fn with_sink(
        source: Arc<dyn TileSource>,
        sink: TileSink,
        options: CrawlerOptions,
    ) -> Result<Self, CrawlerError> {
        options.validate()?;
        let client =
            HttpClient::with_timeouts(options.connect_timeout_secs, options.read_timeout_secs)?;
        let (progress, _) = watch::channel(ProgressSnapshot::default());
        debug!(
            source = source.name(),
            mode = %sink.mode(),
            concurrency = options.concurrency,
            "crawler created"
        );
        Ok(Self {
            fetcher: Fetcher::new(Arc::clone(&source), client),
            source,
            sink: Arc::new(sink),
            checkpoints: Arc::new(CheckpointStore::new(&options.progress_file)),
            options,
            progress: Arc::new(progress),
        })
    }

    /// The sink this crawler writes.
    #[must_use]
    pub fn sink(&self) -> &TileSink {
        &self.sink
    }

    #[must_use]
    pub fn options(&self) -> &CrawlerOptions {
        &self.options
    }

    /// The checkpoint store at `options.progress_file`.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Receives progress snapshots published while running.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    /// Immediate predecessor of `target` in generation order.
    #[must_use]
    pub fn prev_tile(target: TileAddress, levels: &[Level]) -> Option<TileAddress> {
        crate::tile::prev_tile(target, levels)
    }

    /// Runs the full crawl with Ctrl-C wired to a controlled shutdown.
    ///
    /// The signal listener only lives for the duration of this call.
    ///
    /// # Errors
    ///
    /// See [`run_interruptible`](Self::run_interruptible).
    pub async fn run(&self, levels: &[Level]) -> Result<CrawlReport, CrawlerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let listener = spawn_interrupt_listener(&stop);
        let result = self.run_interruptible(levels, stop).await;
        listener.abort();
        result
    }

    /// Runs the full crawl, stopping once `stop` is set.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlerError::SinkClosed`] when the tile store was already
    /// closed, and [`CrawlerError::Sink`] / [`CrawlerError::Checkpoint`] when
    /// the end-of-run flush, metadata write, close or checkpoint save fails.
    #[instrument(skip(self, levels, stop), fields(source = self.source.name(), mode = %self.sink.mode()))]
    pub async fn run_interruptible(
        &self,
        levels: &[Level],
        stop: Arc<AtomicBool>,
    ) -> Result<CrawlReport, CrawlerError> {
        self.ensure_open("run")?;
        let state = Arc::new(Mutex::new(self.initial_state(levels).await));

        self.set_phase(&state, CrawlPhase::Running);
        info!(
            total = lock(&state).total(),
            concurrency = self.options.concurrency,
            "crawl started"
        );

        let worker = Worker {
            fetcher: self.fetcher.clone(),
            sink: Arc::clone(&self.sink),
            state: Arc::clone(&state),
            checkpoints: Arc::clone(&self.checkpoints),
            progress: Arc::clone(&self.progress),
            stop: Arc::clone(&stop),
        };
        let handles: Vec<_> = (0..self.options.concurrency)
            .map(|id| tokio::spawn(worker.clone().run(id)))
            .collect();
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "crawl worker panicked");
            }
        }

        if !stop.load(Ordering::SeqCst) {
            self.set_phase(&state, CrawlPhase::DrainingRetries);
            self.retry_permanent_failures(&state, &stop).await;
        }
        if stop.load(Ordering::SeqCst) {
            return self.shut_down(&state).await;
        }

        let (integrity, repair) = match &*self.sink {
            TileSink::TileStore(store) => {
                store.flush().await?;
                self.write_metadata(levels).await?;
                self.set_phase(&state, CrawlPhase::IntegrityCheck);
                let integrity = self.integrity_report(levels).await?;
                let repair = if integrity.is_incomplete() {
                    self.set_phase(&state, CrawlPhase::Repairing);
                    Some(self.repair_interruptible(levels, Arc::clone(&stop)).await?)
                } else {
                    self.sink.close().await?;
                    None
                };
                (Some(integrity), repair)
            }
            TileSink::FileTree(sink) => {
                sink.flush()?;
                (None, None)
            }
        };

        self.checkpoints.save(&Checkpoint::cleared()).await?;
        self.set_phase(&state, CrawlPhase::Done);

        let state = lock(&state);
        let report = CrawlReport {
            totals: state.totals(),
            done: state.done(),
            total: state.total(),
            permanent_failures: state.failed().to_vec(),
            interrupted: repair.as_ref().is_some_and(|r| r.interrupted),
            integrity,
            repair,
            elapsed: state.elapsed(),
        };
        if report.permanent_failures.is_empty() {
            info!(
                ok = report.totals.ok,
                skip = report.totals.skip,
                fail = report.totals.fail,
                "crawl finished"
            );
        } else {
            warn!(
                ok = report.totals.ok,
                permanent_failures = report.permanent_failures.len(),
                "crawl finished with tiles never stored"
            );
        }
        Ok(report)
    }

    /// Decides where the next run starts.
    ///
    /// A saved cursor wins. Otherwise, with `rollback`, the sink is scanned
    /// for the first missing address and the cursor is saved one address
    /// before it, so the tile next to the gap is verified again.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlerError::SinkClosed`], [`CrawlerError::Sink`] or
    /// [`CrawlerError::Checkpoint`].
    pub async fn prepare_resume(
        &self,
        levels: &[Level],
        rollback: bool,
    ) -> Result<ResumePlan, CrawlerError> {
        let checkpoint = self.checkpoints.load().await;
        if let Some(cursor) = checkpoint.cursor {
            return Ok(ResumePlan::FromCheckpoint { cursor });
        }
        if !rollback {
            return Ok(ResumePlan::Fresh);
        }

        let Some(first_missing) = self.find_first_missing_tile(levels).await? else {
            return Ok(ResumePlan::Complete);
        };
        let cursor = Self::prev_tile(first_missing, levels).unwrap_or(first_missing);
        self.checkpoints
            .save(&Checkpoint {
                cursor: Some(cursor),
                failed: checkpoint.failed,
            })
            .await?;
        info!(first_missing = %first_missing, cursor = %cursor, "resume cursor rolled back");
        Ok(ResumePlan::RolledBack {
            first_missing,
            cursor,
        })
    }

    async fn initial_state(&self, levels: &[Level]) -> CrawlState {
        let checkpoint = self.checkpoints.load().await;
        let total = plan_len(levels);

        let resumed = checkpoint.cursor.and_then(|cursor| {
            let walker = TileWalker::resume_from(levels, cursor);
            if walker.is_none() {
                warn!(cursor = %cursor, "checkpoint cursor is not part of the plan, restarting");
            }
            walker.map(|w| (w, cursor))
        });

        let Some((walker, cursor)) = resumed else {
            if !checkpoint.failed.is_empty() {
                debug!(
                    count = checkpoint.failed.len(),
                    "owed addresses dropped, the full plan is walked again"
                );
            }
            return CrawlState::new(TileWalker::new(levels), total, &self.options);
        };

        info!(cursor = %cursor, "resuming from checkpoint");
        let position = plan_index(cursor, levels).unwrap_or(0);
        // Only owed addresses before the cursor need replaying; the walker
        // yields everything from the cursor on.
        let (owed, ahead): (Vec<_>, Vec<_>) = checkpoint
            .failed
            .into_iter()
            .partition(|address| plan_index(*address, levels).is_some_and(|i| i < position));
        if !ahead.is_empty() {
            debug!(count = ahead.len(), "owed addresses at or after the cursor left to the walker");
        }

        let owed_count = u64::try_from(owed.len()).unwrap_or(u64::MAX);
        let mut state = CrawlState::new(walker, total, &self.options);
        state.resume_at(cursor, position.saturating_sub(owed_count));
        if !owed.is_empty() {
            info!(count = owed.len(), "retrying addresses owed by the last run");
            state.seed_retries(owed);
        }
        state
    }

    // One attempt per permanent failure, no requeue.
    async fn retry_permanent_failures(&self, state: &Mutex<CrawlState>, stop: &AtomicBool) {
        let failed = lock(state).take_failed();
        if failed.is_empty() {
            return;
        }
        info!(count = failed.len(), "retrying permanent failures");

        let mut remaining = Vec::new();
        for address in failed {
            if stop.load(Ordering::SeqCst) {
                remaining.push(address);
                continue;
            }
            let outcome = self.fetcher.fetch_into(&self.sink, address).await;
            lock(state).settle_final(outcome);
            if outcome != Outcome::Ok {
                remaining.push(address);
            }
        }
        lock(state).restore_failed(remaining);
    }

    async fn shut_down(&self, state: &Mutex<CrawlState>) -> Result<CrawlReport, CrawlerError> {
        self.set_phase(state, CrawlPhase::ShuttingDown);
        let checkpoint = lock(state).checkpoint();
        warn!(
            cursor = ?checkpoint.cursor,
            owed = checkpoint.failed.len(),
            "interrupted, saving checkpoint"
        );

        let saved = self.checkpoints.save(&checkpoint).await;
        let closed = self.sink.close().await;
        saved?;
        closed?;

        let state = lock(state);
        Ok(CrawlReport {
            totals: state.totals(),
            done: state.done(),
            total: state.total(),
            permanent_failures: checkpoint.failed,
            interrupted: true,
            integrity: None,
            repair: None,
            elapsed: state.elapsed(),
        })
    }

    async fn write_metadata(&self, levels: &[Level]) -> Result<(), CrawlerError> {
        let store = self.tile_store("metadata write")?;
        match self.source.metadata(levels) {
            Some(metadata) => store.write_metadata(&metadata).await?,
            None => debug!("source provides no metadata"),
        }
        Ok(())
    }

    fn tile_store(&self, operation: &'static str) -> Result<&TileStore, CrawlerError> {
        match self.sink.as_tile_store() {
            None => Err(CrawlerError::UnsupportedSink { operation }),
            Some(store) if store.is_closed() => Err(CrawlerError::SinkClosed { operation }),
            Some(store) => Ok(store),
        }
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), CrawlerError> {
        if self.sink.is_open() {
            Ok(())
        } else {
            Err(CrawlerError::SinkClosed { operation })
        }
    }

    fn set_phase(&self, state: &Mutex<CrawlState>, phase: CrawlPhase) {
        let snapshot = lock(state).set_phase(phase);
        self.publish(snapshot);
    }

    fn publish(&self, snapshot: ProgressSnapshot) {
        self.progress.send_replace(snapshot);
    }
}

/// Sets `stop` on Ctrl-C. Abort the handle to deregister.
fn spawn_interrupt_listener(stop: &Arc<AtomicBool>) -> JoinHandle<()> {
    let stop = Arc::clone(stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight requests");
            stop.store(true, Ordering::SeqCst);
        }
    })
}
