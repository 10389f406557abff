//! Requeue bookkeeping for failed tile fetches.
//!
//! Every failed attempt increments the item's retry count. The item goes back
//! onto the crawler's retry queue while the count stays within the configured
//! maximum, and is demoted to the permanent-failure list afterwards.
//!
//! # Example
//!
//! ```
//! use tilecrawler_core::download::{RetryDecision, RetryPolicy, WorkItem};
//! use tilecrawler_core::TileAddress;
//!
//! let policy = RetryPolicy::new(1);
//! let mut item = WorkItem::fresh(TileAddress { z: 2, x: 1, y: 3 });
//!
//! assert!(matches!(policy.on_failure(&mut item), RetryDecision::Requeue { retry_count: 1 }));
//! assert!(matches!(policy.on_failure(&mut item), RetryDecision::GiveUp { .. }));
//! ```

use tracing::debug;

use crate::tile::TileAddress;

/// Default maximum retry count per address.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// An address pulled for processing, with its failure history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    /// The tile to fetch.
    pub address: TileAddress,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Position in generation order for freshly generated items.
    ///
    /// `None` for items replayed from the retry queue or a checkpoint.
    pub sequence: Option<u64>,
}

impl WorkItem {
    /// An item that has not failed yet.
    #[must_use]
    pub fn fresh(address: TileAddress) -> Self {
        Self {
            address,
            retry_count: 0,
            sequence: None,
        }
    }
}

/// Decision taken after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the item back on the retry queue.
    Requeue {
        /// Retry count after this failure.
        retry_count: u32,
    },

    /// Move the item to the permanent-failure list.
    GiveUp {
        /// Human-readable reason.
        reason: String,
    },
}

/// Retry limit shared by all workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_retries` requeues per address.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Maximum retry count.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Records a failure on `item` and decides where it goes next.
    pub fn on_failure(&self, item: &mut WorkItem) -> RetryDecision {
        item.retry_count += 1;
        // Replayed items no longer hold a place in generation order.
        item.sequence = None;

        if item.retry_count <= self.max_retries {
            debug!(
                tile = %item.address,
                retry_count = item.retry_count,
                max = self.max_retries,
                "requeue"
            );
            RetryDecision::Requeue {
                retry_count: item.retry_count,
            }
        } else {
            debug!(tile = %item.address, retry_count = item.retry_count, "giving up");
            RetryDecision::GiveUp {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem {
            address: TileAddress { z: 1, x: 0, y: 1 },
            retry_count: 0,
            sequence: Some(7),
        }
    }

    #[test]
    fn test_default_max_retries() {
        assert_eq!(RetryPolicy::default().max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(DEFAULT_MAX_RETRIES, 5);
    }

    #[test]
    fn test_requeues_until_limit() {
        let policy = RetryPolicy::new(2);
        let mut item = item();

        assert_eq!(
            policy.on_failure(&mut item),
            RetryDecision::Requeue { retry_count: 1 }
        );
        assert_eq!(
            policy.on_failure(&mut item),
            RetryDecision::Requeue { retry_count: 2 }
        );
        assert!(matches!(
            policy.on_failure(&mut item),
            RetryDecision::GiveUp { .. }
        ));
        assert_eq!(item.retry_count, 3);
    }

    #[test]
    fn test_zero_retries_gives_up_immediately() {
        let policy = RetryPolicy::new(0);
        let mut item = item();
        assert!(matches!(
            policy.on_failure(&mut item),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_failure_drops_sequence() {
        let policy = RetryPolicy::new(3);
        let mut item = item();
        policy.on_failure(&mut item);
        assert_eq!(item.sequence, None);
    }
}
