//! Adaptive pacing between tile requests.
//!
//! The [`RateLimiter`] keeps a short window of success flags and rescales the
//! inter-request delay after every attempt:
//!
//! | recent fail rate | new delay |
//! |---|---|
//! | > 0.30 | delay x 1.5 |
//! | > 0.10 | delay x 1.2 |
//! | < 0.01 | delay x 0.7 |
//! | < 0.05 | delay x 0.9 |
//! | otherwise | base delay |
//!
//! The result is always clamped to `[min_delay, max_delay]`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tilecrawler_core::download::{DelayConfig, RateLimiter};
//!
//! let mut limiter = RateLimiter::new(DelayConfig {
//!     base: Duration::from_millis(50),
//!     min: Duration::from_millis(10),
//!     max: Duration::from_secs(2),
//!     window: 4,
//! });
//! let delay = limiter.record(false);
//! assert!(delay > Duration::from_millis(50));
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use tracing::trace;

/// Default base delay between requests.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(50);

/// Default lower bound for the adaptive delay.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(50);

/// Default upper bound for the adaptive delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(2000);

/// Default number of outcomes in the pacing window.
pub const DEFAULT_PACING_WINDOW: usize = 100;

/// Pacing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayConfig {
    /// Delay used when the fail rate is unremarkable.
    pub base: Duration,
    /// Lower clamp.
    pub min: Duration,
    /// Upper clamp.
    pub max: Duration,
    /// Number of recent outcomes considered.
    pub window: usize,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_DELAY,
            min: DEFAULT_MIN_DELAY,
            max: DEFAULT_MAX_DELAY,
            window: DEFAULT_PACING_WINDOW,
        }
    }
}

/// Multiplicative back-off driven by the recent fail rate.
///
/// Not synchronized; the crawler keeps it inside its shared state and
/// sleeps for the returned delay after releasing the lock.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: DelayConfig,
    recent: VecDeque<bool>,
    failures: usize,
    delay: Duration,
}

impl RateLimiter {
    /// Creates a limiter starting at the clamped base delay.
    ///
    /// Bounds given in the wrong order are swapped.
    #[must_use]
    pub fn new(config: DelayConfig) -> Self {
        let config = DelayConfig {
            min: config.min.min(config.max),
            max: config.min.max(config.max),
            window: config.window.max(1),
            ..config
        };
        let delay = config.base.clamp(config.min, config.max);
        Self {
            config,
            recent: VecDeque::with_capacity(config.window),
            failures: 0,
            delay,
        }
    }

    /// A limiter that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(DelayConfig {
            base: Duration::ZERO,
            min: Duration::ZERO,
            max: Duration::ZERO,
            window: 1,
        })
    }

    /// Records one attempt and returns the delay to wait before the next one.
    pub fn record(&mut self, success: bool) -> Duration {
        if self.recent.len() == self.config.window
            && let Some(false) = self.recent.pop_front()
        {
            self.failures -= 1;
        }
        self.recent.push_back(success);
        if !success {
            self.failures += 1;
        }

        let rate = self.recent_fail_rate();
        let next = if rate > 0.30 {
            self.delay * 3 / 2
        } else if rate > 0.10 {
            self.delay * 6 / 5
        } else if rate < 0.01 {
            self.delay * 7 / 10
        } else if rate < 0.05 {
            self.delay * 9 / 10
        } else {
            self.config.base
        };
        self.delay = next.clamp(self.config.min, self.config.max);

        trace!(
            fail_rate = rate,
            delay_ms = self.delay.as_millis(),
            "pacing adjusted"
        );
        self.delay
    }

    /// Fraction of failures among the outcomes currently in the window.
    ///
    /// Zero before anything is recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn recent_fail_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.failures as f64 / self.recent.len() as f64
    }

    /// Delay currently in effect.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    /// Configured bounds.
    #[must_use]
    pub fn config(&self) -> DelayConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(base: u64, min: u64, max: u64, window: usize) -> RateLimiter {
        RateLimiter::new(DelayConfig {
            base: Duration::from_millis(base),
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
            window,
        })
    }

    #[test]
    fn test_starts_at_clamped_base() {
        assert_eq!(
            limiter(50, 10, 2000, 10).current_delay(),
            Duration::from_millis(50)
        );
        assert_eq!(
            limiter(5, 10, 2000, 10).current_delay(),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_sustained_failure_backs_off_to_max() {
        let mut limiter = limiter(100, 10, 1000, 2);
        let first = limiter.record(false);
        assert_eq!(first, Duration::from_millis(150));

        for _ in 0..20 {
            limiter.record(false);
        }
        assert_eq!(limiter.current_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_sustained_success_relaxes_to_min() {
        let mut limiter = limiter(100, 20, 1000, 10);
        assert_eq!(limiter.record(true), Duration::from_millis(70));
        for _ in 0..20 {
            limiter.record(true);
        }
        assert_eq!(limiter.current_delay(), Duration::from_millis(20));
    }

    #[test]
    fn test_moderate_fail_rate_grows_by_one_point_two() {
        // window 10, full: 2 failures -> rate 0.2
        let mut limiter = limiter(100, 10, 10_000, 10);
        for _ in 0..8 {
            limiter.record(true);
        }
        limiter.record(false);
        let before = limiter.current_delay();
        let after = limiter.record(false);
        assert!((limiter.recent_fail_rate() - 0.2).abs() < 1e-9);
        assert_eq!(after, before * 6 / 5);
    }

    #[test]
    fn test_middle_band_returns_base() {
        // window 20, full: 1 failure -> rate 0.05 exactly
        let mut limiter = limiter(100, 10, 1000, 20);
        for _ in 0..19 {
            limiter.record(true);
        }
        let delay = limiter.record(false);
        assert!((limiter.recent_fail_rate() - 0.05).abs() < 1e-9);
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn test_low_fail_rate_band_scales_by_point_nine() {
        // window 50, full: 1 failure -> rate 0.02
        let mut limiter = limiter(100, 1, 1000, 50);
        limiter.record(false);
        for _ in 0..48 {
            limiter.record(true);
        }
        let before = limiter.current_delay();
        let after = limiter.record(true);
        assert!((limiter.recent_fail_rate() - 0.02).abs() < 1e-9);
        assert_eq!(after, before * 9 / 10);
    }

    #[test]
    fn test_fail_rate_uses_recorded_outcomes_before_window_fills() {
        let mut limiter = RateLimiter::new(DelayConfig::default());
        assert!(limiter.recent_fail_rate().abs() < 1e-9);

        assert_eq!(limiter.record(false), Duration::from_millis(75));
        assert!((limiter.recent_fail_rate() - 1.0).abs() < 1e-9);

        for _ in 0..19 {
            limiter.record(false);
        }
        assert_eq!(limiter.current_delay(), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_window_forgets_old_failures() {
        let mut limiter = limiter(100, 10, 1000, 4);
        for _ in 0..4 {
            limiter.record(false);
        }
        assert!((limiter.recent_fail_rate() - 1.0).abs() < 1e-9);
        for _ in 0..4 {
            limiter.record(true);
        }
        assert!(limiter.recent_fail_rate().abs() < 1e-9);
    }

    #[test]
    fn test_delay_always_within_bounds() {
        let mut limiter = limiter(300, 40, 900, 7);
        let min = Duration::from_millis(40);
        let max = Duration::from_millis(900);
        for i in 0u32..2_000 {
            let success = (i.wrapping_mul(2_654_435_761) >> 7) % 5 != 0 || (i / 97) % 3 == 0;
            let delay = limiter.record(success);
            assert!(delay >= min && delay <= max, "step {i}: {delay:?}");
        }
    }

    #[test]
    fn test_disabled_never_waits() {
        let mut limiter = RateLimiter::disabled();
        assert_eq!(limiter.record(false), Duration::ZERO);
        assert_eq!(limiter.record(true), Duration::ZERO);
    }

    #[test]
    fn test_inverted_bounds_are_swapped() {
        let limiter = limiter(50, 500, 100, 10);
        assert_eq!(limiter.config().min, Duration::from_millis(100));
        assert_eq!(limiter.config().max, Duration::from_millis(500));
    }
}
