//! Sliding-window outcome statistics for progress reporting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default number of outcomes kept in the window.
pub const DEFAULT_STATS_WINDOW: usize = 500;

/// Result of one attempt on one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fetched, validated and written.
    Ok,
    /// Fetch, validation or write failed.
    Fail,
    /// Already present in the sink.
    Skip,
}

/// Cumulative outcome counts since the stats were created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTotals {
    /// Successful attempts.
    pub ok: u64,
    /// Failed attempts.
    pub fail: u64,
    /// Skipped addresses.
    pub skip: u64,
}

/// Ring buffer of recent outcomes with incrementally maintained counts.
#[derive(Debug)]
pub struct RuntimeStats {
    window: VecDeque<Outcome>,
    capacity: usize,
    ok: usize,
    fail: usize,
    skip: usize,
    totals: OutcomeTotals,
    started: Instant,
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_WINDOW)
    }
}

impl RuntimeStats {
    /// Creates stats with a window of `capacity` outcomes (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            ok: 0,
            fail: 0,
            skip: 0,
            totals: OutcomeTotals::default(),
            started: Instant::now(),
        }
    }

    /// Records one outcome, evicting the oldest when the window is full.
    pub fn mark(&mut self, outcome: Outcome) {
        if self.window.len() == self.capacity
            && let Some(evicted) = self.window.pop_front()
        {
            *self.counter(evicted) -= 1;
        }
        self.window.push_back(outcome);
        *self.counter(outcome) += 1;

        match outcome {
            Outcome::Ok => self.totals.ok += 1,
            Outcome::Fail => self.totals.fail += 1,
            Outcome::Skip => self.totals.skip += 1,
        }
    }

    /// Percentage of failed fetches among fetches in the window.
    #[must_use]
    pub fn fail_rate(&self) -> f64 {
        percentage(self.fail, self.ok + self.fail)
    }

    /// Percentage of skips among skips and successes in the window.
    #[must_use]
    pub fn skip_rate(&self) -> f64 {
        percentage(self.skip, self.ok + self.skip)
    }

    /// Addresses per second given `done` completed addresses.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn speed(&self, done: u64) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= f64::EPSILON {
            0.0
        } else {
            done as f64 / secs
        }
    }

    /// Time since the stats were created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Cumulative counts.
    #[must_use]
    pub fn totals(&self) -> OutcomeTotals {
        self.totals
    }

    /// Counts currently inside the window as `(ok, fail, skip)`.
    #[must_use]
    pub fn window_counts(&self) -> (usize, usize, usize) {
        (self.ok, self.fail, self.skip)
    }

    fn counter(&mut self, outcome: Outcome) -> &mut usize {
        match outcome {
            Outcome::Ok => &mut self.ok,
            Outcome::Fail => &mut self.fail,
            Outcome::Skip => &mut self.skip,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_on_empty_window() {
        let stats = RuntimeStats::new(10);
        assert!(stats.fail_rate().abs() < f64::EPSILON);
        assert!(stats.skip_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_fail_rate_and_skip_rate() {
        let mut stats = RuntimeStats::new(10);
        stats.mark(Outcome::Ok);
        stats.mark(Outcome::Ok);
        stats.mark(Outcome::Ok);
        stats.mark(Outcome::Fail);
        stats.mark(Outcome::Skip);

        assert!((stats.fail_rate() - 25.0).abs() < 1e-9);
        assert!((stats.skip_rate() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut stats = RuntimeStats::new(3);
        stats.mark(Outcome::Fail);
        stats.mark(Outcome::Ok);
        stats.mark(Outcome::Ok);
        assert_eq!(stats.window_counts(), (2, 1, 0));

        stats.mark(Outcome::Skip);
        assert_eq!(stats.window_counts(), (2, 0, 1));
        assert!(stats.fail_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_counts_match_rescan() {
        let pattern = [Outcome::Ok, Outcome::Fail, Outcome::Skip, Outcome::Ok];
        let mut stats = RuntimeStats::new(7);
        let mut history = Vec::new();

        for i in 0..50 {
            let outcome = pattern[(i * 7 + i / 3) % pattern.len()];
            stats.mark(outcome);
            history.push(outcome);

            let tail = &history[history.len().saturating_sub(7)..];
            let count = |o| tail.iter().filter(|&&t| t == o).count();
            assert_eq!(
                stats.window_counts(),
                (count(Outcome::Ok), count(Outcome::Fail), count(Outcome::Skip))
            );
        }
    }

    #[test]
    fn test_totals_are_cumulative() {
        let mut stats = RuntimeStats::new(2);
        for _ in 0..5 {
            stats.mark(Outcome::Ok);
        }
        stats.mark(Outcome::Fail);
        assert_eq!(
            stats.totals(),
            OutcomeTotals {
                ok: 5,
                fail: 1,
                skip: 0
            }
        );
    }
}
