//! Shared crawl state.
//!
//! Everything here is mutated under one lock and never across an `.await`,
//! so pulling an address, settling an outcome and capturing a checkpoint are
//! each atomic with respect to the other workers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::progress::{CrawlPhase, ProgressSnapshot};
use crate::checkpoint::Checkpoint;
use crate::config::CrawlerOptions;
use crate::download::{RateLimiter, RetryDecision, RetryPolicy, WorkItem};
use crate::stats::{Outcome, OutcomeTotals, RuntimeStats};
use crate::tile::{TileAddress, TileWalker};

/// Side effects a worker performs after settling an attempt, outside the lock.
#[derive(Debug, Default)]
pub(super) struct Settled {
    /// Pause before the next attempt; `None` after a skip.
    pub delay: Option<Duration>,
    /// Snapshot to publish.
    pub progress: Option<ProgressSnapshot>,
    /// Checkpoint to flush and save.
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug)]
pub(super) struct CrawlState {
    walker: TileWalker,
    next_sequence: u64,
    retry: VecDeque<WorkItem>,
    // Fresh addresses pulled but not settled, keyed by generation sequence.
    in_flight: BTreeMap<u64, TileAddress>,
    // Replayed addresses pulled but not settled.
    replaying: Vec<TileAddress>,
    last_pulled: Option<TileAddress>,
    failed: Vec<TileAddress>,
    done: u64,
    total: u64,
    stats: RuntimeStats,
    limiter: RateLimiter,
    policy: RetryPolicy,
    phase: CrawlPhase,
    progress_every: u64,
    since_progress: u64,
    checkpoint_every: u64,
    checkpoint_interval: Duration,
    since_checkpoint: u64,
    last_checkpoint: Instant,
}

impl CrawlState {
    pub(super) fn new(walker: TileWalker, total: u64, options: &CrawlerOptions) -> Self {
        Self {
            walker,
            next_sequence: 0,
            retry: VecDeque::new(),
            in_flight: BTreeMap::new(),
            replaying: Vec::new(),
            last_pulled: None,
            failed: Vec::new(),
            done: 0,
            total,
            stats: RuntimeStats::new(options.stats_window),
            limiter: RateLimiter::new(options.delay_config()),
            policy: RetryPolicy::new(options.max_retry),
            phase: CrawlPhase::Init,
            progress_every: options.progress_every(),
            since_progress: 0,
            checkpoint_every: options.checkpoint_every,
            checkpoint_interval: options.checkpoint_interval(),
            since_checkpoint: 0,
            last_checkpoint: Instant::now(),
        }
    }

    /// Marks `cursor` as the resume point; `done` addresses precede it.
    pub(super) fn resume_at(&mut self, cursor: TileAddress, done: u64) {
        self.last_pulled = Some(cursor);
        self.done = done;
    }

    /// Queues addresses owed by a previous run ahead of fresh ones.
    pub(super) fn seed_retries(&mut self, addresses: impl IntoIterator<Item = TileAddress>) {
        self.retry.extend(addresses.into_iter().map(WorkItem::fresh));
    }

    /// Pulls the next item: retries first, then the next fresh address.
    pub(super) fn next_item(&mut self) -> Option<WorkItem> {
        if let Some(item) = self.retry.pop_front() {
            self.replaying.push(item.address);
            return Some(item);
        }

        let address = self.walker.next()?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.in_flight.insert(sequence, address);
        self.last_pulled = Some(address);
        Some(WorkItem {
            address,
            retry_count: 0,
            sequence: Some(sequence),
        })
    }

    /// Records the outcome of one attempt made by the worker pool.
    pub(super) fn settle(&mut self, mut item: WorkItem, outcome: Outcome) -> Settled {
        match item.sequence {
            Some(sequence) => {
                self.in_flight.remove(&sequence);
            }
            None => {
                if let Some(i) = self.replaying.iter().position(|a| *a == item.address) {
                    self.replaying.swap_remove(i);
                }
            }
        }
        self.stats.mark(outcome);

        let delay = match outcome {
            Outcome::Skip => {
                self.done += 1;
                None
            }
            Outcome::Ok => {
                self.done += 1;
                Some(self.limiter.record(true))
            }
            Outcome::Fail => {
                let delay = self.limiter.record(false);
                match self.policy.on_failure(&mut item) {
                    RetryDecision::Requeue { .. } => self.retry.push_back(item),
                    RetryDecision::GiveUp { reason } => {
                        debug!(tile = %item.address, %reason, "tile moved to permanent failures");
                        self.failed.push(item.address);
                    }
                }
                Some(delay)
            }
        };

        let mut settled = Settled {
            delay,
            ..Settled::default()
        };

        self.since_progress += 1;
        if self.since_progress >= self.progress_every {
            self.since_progress = 0;
            settled.progress = Some(self.snapshot());
        }

        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.checkpoint_every
            || self.last_checkpoint.elapsed() >= self.checkpoint_interval
        {
            self.since_checkpoint = 0;
            self.last_checkpoint = Instant::now();
            settled.checkpoint = Some(self.checkpoint());
        }

        settled
    }

    /// Records one attempt of the sequential pass over permanent failures.
    pub(super) fn settle_final(&mut self, outcome: Outcome) {
        self.stats.mark(outcome);
        if outcome != Outcome::Fail {
            self.done += 1;
        }
    }

    /// Removes and returns the permanent-failure list.
    pub(super) fn take_failed(&mut self) -> Vec<TileAddress> {
        std::mem::take(&mut self.failed)
    }

    /// Puts addresses back on the permanent-failure list.
    pub(super) fn restore_failed(&mut self, addresses: Vec<TileAddress>) {
        self.failed.extend(addresses);
    }

    pub(super) fn failed(&self) -> &[TileAddress] {
        &self.failed
    }

    /// Earliest fresh address still in flight, else the last one pulled.
    ///
    /// Every address strictly before it in generation order has settled.
    pub(super) fn cursor(&self) -> Option<TileAddress> {
        self.in_flight.values().next().copied().or(self.last_pulled)
    }

    /// Resume record listing permanent failures and pending retries.
    pub(super) fn checkpoint(&self) -> Checkpoint {
        let mut failed = self.failed.clone();
        failed.extend(self.replaying.iter().copied());
        failed.extend(self.retry.iter().map(|item| item.address));
        Checkpoint {
            cursor: self.cursor(),
            failed,
        }
    }

    pub(super) fn set_phase(&mut self, phase: CrawlPhase) -> ProgressSnapshot {
        debug!(from = %self.phase, to = %phase, "crawl phase changed");
        self.phase = phase;
        self.snapshot()
    }

    pub(super) fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.phase,
            done: self.done,
            total: self.total,
            speed: self.stats.speed(self.done),
            fail_rate: self.stats.fail_rate(),
            skip_rate: self.stats.skip_rate(),
            retry_pending: self.retry.len(),
            permanent_failures: self.failed.len(),
            delay: self.limiter.current_delay(),
        }
    }

    pub(super) fn totals(&self) -> OutcomeTotals {
        self.stats.totals()
    }

    pub(super) fn done(&self) -> u64 {
        self.done
    }

    pub(super) fn total(&self) -> u64 {
        self.total
    }

    pub(super) fn elapsed(&self) -> Duration {
        self.stats.elapsed()
    }
}

pub(super) fn lock(state: &Mutex<CrawlState>) -> MutexGuard<'_, CrawlState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tile::{Level, plan_len};

    fn addr(z: u8, x: u32, y: u32) -> TileAddress {
        TileAddress { z, x, y }
    }

    fn options(max_retry: u32) -> CrawlerOptions {
        CrawlerOptions {
            concurrency: 1,
            max_retry,
            delay_ms: 0,
            min_delay_ms: 0,
            max_delay_ms: 0,
            ..CrawlerOptions::default()
        }
    }

    fn state(levels: &[Level], max_retry: u32) -> CrawlState {
        CrawlState::new(
            TileWalker::new(levels),
            plan_len(levels),
            &options(max_retry),
        )
    }

    // ==================== Pulling ====================

    #[test]
    fn test_retry_queue_has_priority_over_fresh_addresses() {
        let mut state = state(&[Level::full(1)], 3);
        let first = state.next_item().unwrap();
        assert_eq!(first.address, addr(1, 0, 0));

        state.settle(first, Outcome::Fail);
        let replay = state.next_item().unwrap();
        assert_eq!(replay.address, addr(1, 0, 0));
        assert_eq!(replay.retry_count, 1);
        assert_eq!(replay.sequence, None);

        assert_eq!(state.next_item().unwrap().address, addr(1, 0, 1));
    }

    #[test]
    fn test_exhausted_when_walker_and_retries_empty() {
        let mut state = state(&[Level::full(0)], 0);
        let item = state.next_item().unwrap();
        assert!(state.next_item().is_none());

        state.settle(item, Outcome::Fail);
        assert!(state.next_item().is_none());
        assert_eq!(state.failed(), &[addr(0, 0, 0)]);
    }

    #[test]
    fn test_seeded_retries_come_first() {
        let mut state = state(&[Level::full(1)], 3);
        state.seed_retries([addr(5, 1, 1)]);
        assert_eq!(state.next_item().unwrap().address, addr(5, 1, 1));
    }

    // ==================== Settling ====================

    #[test]
    fn test_done_counts_ok_and_skip_only() {
        let mut state = state(&[Level::full(1)], 0);
        let a = state.next_item().unwrap();
        let b = state.next_item().unwrap();
        let c = state.next_item().unwrap();

        assert!(state.settle(a, Outcome::Ok).delay.is_some());
        assert!(state.settle(b, Outcome::Skip).delay.is_none());
        state.settle(c, Outcome::Fail);

        assert_eq!(state.done(), 2);
        assert_eq!(
            state.totals(),
            OutcomeTotals {
                ok: 1,
                fail: 1,
                skip: 1
            }
        );
    }

    #[test]
    fn test_give_up_after_max_retry() {
        let mut state = state(&[Level::full(0)], 1);
        let item = state.next_item().unwrap();
        state.settle(item, Outcome::Fail);
        let item = state.next_item().unwrap();
        state.settle(item, Outcome::Fail);

        assert!(state.next_item().is_none());
        assert_eq!(state.take_failed(), vec![addr(0, 0, 0)]);
        assert!(state.failed().is_empty());
    }

    #[test]
    fn test_settle_final_counts_recovered_tiles() {
        let mut state = state(&[Level::full(0)], 0);
        state.settle_final(Outcome::Ok);
        state.settle_final(Outcome::Fail);
        assert_eq!(state.done(), 1);
        assert_eq!(state.totals().fail, 1);
    }

    // ==================== Cursor and checkpoints ====================

    #[test]
    fn test_cursor_is_earliest_in_flight_address() {
        let mut state = state(&[Level::full(1)], 3);
        assert_eq!(state.cursor(), None);

        let a = state.next_item().unwrap();
        let b = state.next_item().unwrap();
        let c = state.next_item().unwrap();
        assert_eq!(state.cursor(), Some(a.address));

        state.settle(b, Outcome::Ok);
        assert_eq!(state.cursor(), Some(a.address));

        state.settle(a, Outcome::Ok);
        assert_eq!(state.cursor(), Some(c.address));

        state.settle(c, Outcome::Ok);
        assert_eq!(state.cursor(), Some(addr(1, 1, 0)));
    }

    #[test]
    fn test_resume_point_survives_until_first_pull() {
        let levels = [Level::full(1)];
        let mut state = CrawlState::new(
            TileWalker::resume_from(&levels, addr(1, 1, 0)).unwrap(),
            4,
            &options(3),
        );
        state.resume_at(addr(1, 1, 0), 2);
        assert_eq!(state.cursor(), Some(addr(1, 1, 0)));
        assert_eq!(state.snapshot().done, 2);
    }

    #[test]
    fn test_checkpoint_lists_failures_and_pending_retries() {
        let mut state = state(&[Level::full(1)], 1);
        let a = state.next_item().unwrap();
        state.settle(a, Outcome::Fail);
        state.restore_failed(vec![addr(3, 0, 0)]);

        let checkpoint = state.checkpoint();
        assert_eq!(checkpoint.failed, vec![addr(3, 0, 0), addr(1, 0, 0)]);
        assert_eq!(checkpoint.cursor, Some(addr(1, 0, 0)));
    }

    #[test]
    fn test_checkpoint_keeps_replayed_items_in_flight() {
        let mut state = state(&[Level::full(1)], 3);
        state.seed_retries([addr(4, 2, 2)]);
        let replay = state.next_item().unwrap();

        assert_eq!(state.checkpoint().failed, vec![addr(4, 2, 2)]);
        state.settle(replay, Outcome::Ok);
        assert!(state.checkpoint().failed.is_empty());
    }

    #[test]
    fn test_checkpoint_due_every_n_completions() {
        let opts = CrawlerOptions {
            checkpoint_every: 2,
            ..options(0)
        };
        let levels = [Level::full(2)];
        let mut state = CrawlState::new(TileWalker::new(&levels), 16, &opts);

        let a = state.next_item().unwrap();
        assert!(state.settle(a, Outcome::Ok).checkpoint.is_none());
        let b = state.next_item().unwrap();
        let checkpoint = state.settle(b, Outcome::Ok).checkpoint.unwrap();
        assert_eq!(checkpoint.cursor, Some(addr(2, 0, 1)));
    }

    #[test]
    fn test_progress_every_tenth_of_concurrency() {
        let opts = CrawlerOptions {
            concurrency: 30,
            ..options(0)
        };
        let levels = [Level::full(2)];
        let mut state = CrawlState::new(TileWalker::new(&levels), 16, &opts);

        let published: usize = (0..9)
            .filter_map(|_| {
                let item = state.next_item()?;
                state.settle(item, Outcome::Ok).progress
            })
            .count();
        assert_eq!(published, 3);
    }

    #[test]
    fn test_set_phase_snapshot() {
        let mut state = state(&[Level::full(1)], 0);
        let snapshot = state.set_phase(CrawlPhase::Running);
        assert_eq!(snapshot.phase, CrawlPhase::Running);
        assert_eq!(snapshot.total, 4);
    }
}
