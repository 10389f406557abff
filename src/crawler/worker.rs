//! Fetch-and-store step and the worker loop of the main pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

use super::progress::ProgressSnapshot;
use super::state::{CrawlState, lock};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::download::{DownloadError, HttpClient};
use crate::sink::TileSink;
use crate::source::TileSource;
use crate::stats::Outcome;
use crate::tile::TileAddress;

/// Builds URLs, fetches and validates payloads, and hands them to the sink.
#[derive(Clone)]
pub(super) struct Fetcher {
    source: Arc<dyn TileSource>,
    client: HttpClient,
    requests: Arc<AtomicU64>,
}

impl Fetcher {
    pub(super) fn new(source: Arc<dyn TileSource>, client: HttpClient) -> Self {
        Self {
            source,
            client,
            requests: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fetches one tile and checks it against the source's validator.
    pub(super) async fn fetch(&self, address: TileAddress) -> Result<Vec<u8>, DownloadError> {
        let counter = self.requests.fetch_add(1, Ordering::Relaxed);
        let url = self.source.tile_url(address, counter);
        let bytes = self
            .client
            .fetch(&url, self.source.request_headers())
            .await?;
        if !self.source.validate_tile(&bytes) {
            return Err(DownloadError::invalid_tile(url, bytes.len()));
        }
        Ok(bytes)
    }

    /// Fetches one tile and writes it. Every failure folds into `Fail`.
    pub(super) async fn fetch_into(&self, sink: &TileSink, address: TileAddress) -> Outcome {
        let bytes = match self.fetch(address).await {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(tile = %address, error = %error, "no tile");
                return Outcome::Fail;
            }
        };
        match sink.write(address, bytes).await {
            Ok(()) => Outcome::Ok,
            Err(error) => {
                warn!(tile = %address, error = %error, "sink write failed");
                Outcome::Fail
            }
        }
    }
}

/// One member of the main pool. Cloned into each spawned task.
#[derive(Clone)]
pub(super) struct Worker {
    pub(super) fetcher: Fetcher,
    pub(super) sink: Arc<TileSink>,
    pub(super) state: Arc<Mutex<CrawlState>>,
    pub(super) checkpoints: Arc<CheckpointStore>,
    pub(super) progress: Arc<watch::Sender<ProgressSnapshot>>,
    pub(super) stop: Arc<AtomicBool>,
}

impl Worker {
    /// Pulls and settles addresses until the plan and retry queue are empty
    /// or a stop is requested.
    pub(super) async fn run(self, id: usize) {
        while !self.stop.load(Ordering::SeqCst) {
            let Some(item) = lock(&self.state).next_item() else {
                break;
            };

            let outcome = self.attempt(item.address).await;
            let settled = lock(&self.state).settle(item, outcome);

            if let Some(snapshot) = settled.progress {
                self.progress.send_replace(snapshot);
            }
            if let Some(checkpoint) = settled.checkpoint {
                self.save_checkpoint(&checkpoint).await;
            }
            if let Some(delay) = settled.delay
                && !delay.is_zero()
            {
                tokio::time::sleep(delay).await;
            }
        }
        debug!(worker = id, "worker exited");
    }

    async fn attempt(&self, address: TileAddress) -> Outcome {
        match self.sink.contains(address).await {
            Ok(true) => return Outcome::Skip,
            Ok(false) => {}
            Err(error) => warn!(tile = %address, error = %error, "existence check failed"),
        }
        self.fetcher.fetch_into(&self.sink, address).await
    }

    // The sink is flushed first so every address before the cursor is durable.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) {
        if let Err(error) = self.sink.flush().await {
            warn!(error = %error, "flush before checkpoint failed, skipping save");
            return;
        }
        if let Err(error) = self.checkpoints.save(checkpoint).await {
            warn!(error = %error, "periodic checkpoint save failed");
        }
    }
}
