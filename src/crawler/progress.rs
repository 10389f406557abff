//! Crawl lifecycle phases and the progress snapshots published while running.

use std::fmt;
use std::time::Duration;

/// Lifecycle phase of a crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CrawlPhase {
    /// Opened, nothing pulled yet.
    #[default]
    Init,
    /// Worker pool is pulling addresses.
    Running,
    /// Sequential pass over permanent failures.
    DrainingRetries,
    /// Counting stored tiles per level.
    IntegrityCheck,
    /// Fetching addresses found missing.
    Repairing,
    /// Finished; the checkpoint is cleared.
    Done,
    /// Interrupted; the checkpoint holds the resume point.
    ShuttingDown,
}

impl fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::DrainingRetries => "draining retries",
            Self::IntegrityCheck => "integrity check",
            Self::Repairing => "repairing",
            Self::Done => "done",
            Self::ShuttingDown => "shutting down",
        })
    }
}

/// Point-in-time view of a crawl, published through a `watch` channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    /// Current phase.
    pub phase: CrawlPhase,
    /// Addresses done (stored or skipped), or repaired during repair.
    pub done: u64,
    /// Addresses in the plan, or missing ones during repair.
    pub total: u64,
    /// Addresses per second since the crawl started.
    pub speed: f64,
    /// Windowed failure percentage.
    pub fail_rate: f64,
    /// Windowed skip percentage.
    pub skip_rate: f64,
    /// Items waiting in the retry queue.
    pub retry_pending: usize,
    /// Addresses that exhausted their retries.
    pub permanent_failures: usize,
    /// Adaptive delay currently in effect.
    pub delay: Duration,
}

impl ProgressSnapshot {
    /// Completed fraction in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.done as f64 / self.total as f64).min(1.0)
        }
    }

    /// Estimated time to finish at the current speed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn eta(&self) -> Option<Duration> {
        if self.speed <= f64::EPSILON {
            return None;
        }
        let remaining = self.total.saturating_sub(self.done) as f64;
        Some(Duration::from_secs_f64(remaining / self.speed))
    }
}
