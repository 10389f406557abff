//! Deterministic generation order over a crawl plan.
//!
//! Levels are visited in configured order; within a level columns run from
//! `min_x` to `max_x` and, for each column, rows from `min_y` to `max_y`.
//! Checkpoint cursors are positions in this order, so it must never change.

use super::{Level, TileAddress, TileRange, compute_tile_range};

/// Lazy iterator over every address of a plan in generation order.
#[derive(Debug, Clone)]
pub struct TileWalker {
    plan: Vec<(u8, TileRange)>,
    level: usize,
    x: u32,
    y: u32,
}

impl TileWalker {
    /// Starts at the first address of the plan.
    #[must_use]
    pub fn new(levels: &[Level]) -> Self {
        let plan = build_plan(levels);
        let (x, y) = plan.first().map_or((0, 0), |(_, r)| (r.min_x, r.min_y));
        Self {
            plan,
            level: 0,
            x,
            y,
        }
    }

    /// Starts at `cursor`, skipping every address strictly before it.
    ///
    /// The cursor itself is yielded first. Returns `None` when the cursor is
    /// not part of the plan. Positioning is direct rather than a scan, so
    /// resuming deep into a high zoom level costs nothing.
    #[must_use]
    pub fn resume_from(levels: &[Level], cursor: TileAddress) -> Option<Self> {
        let plan = build_plan(levels);
        let level = position_of(&plan, cursor)?;
        Some(Self {
            plan,
            level,
            x: cursor.x,
            y: cursor.y,
        })
    }

    /// Whether the walker has yielded its last address.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.level >= self.plan.len()
    }
}

impl Iterator for TileWalker {
    type Item = TileAddress;

    fn next(&mut self) -> Option<TileAddress> {
        let (z, range) = *self.plan.get(self.level)?;
        let address = TileAddress {
            z,
            x: self.x,
            y: self.y,
        };

        if self.y < range.max_y {
            self.y += 1;
        } else if self.x < range.max_x {
            self.x += 1;
            self.y = range.min_y;
        } else {
            self.level += 1;
            if let Some((_, next)) = self.plan.get(self.level) {
                self.x = next.min_x;
                self.y = next.min_y;
            }
        }

        Some(address)
    }
}

/// Total number of addresses in the plan.
#[must_use]
pub fn plan_len(levels: &[Level]) -> u64 {
    levels.iter().map(|l| compute_tile_range(l).len()).sum()
}

/// Number of addresses strictly before `target` in generation order.
///
/// Returns `None` when `target` is not in the plan.
#[must_use]
pub fn plan_index(target: TileAddress, levels: &[Level]) -> Option<u64> {
    let plan = build_plan(levels);
    let index = position_of(&plan, target)?;
    let before: u64 = plan[..index].iter().map(|(_, r)| r.len()).sum();
    let (_, range) = plan[index];
    Some(
        before
            + u64::from(target.x - range.min_x) * range.height()
            + u64::from(target.y - range.min_y),
    )
}

/// Immediate predecessor of `target` in generation order.
///
/// Returns `None` when `target` is the first address or is not in the plan.
#[must_use]
pub fn prev_tile(target: TileAddress, levels: &[Level]) -> Option<TileAddress> {
    let plan = build_plan(levels);
    let index = position_of(&plan, target)?;
    let (z, range) = plan[index];

    if target.y > range.min_y {
        return Some(TileAddress {
            z,
            x: target.x,
            y: target.y - 1,
        });
    }
    if target.x > range.min_x {
        return Some(TileAddress {
            z,
            x: target.x - 1,
            y: range.max_y,
        });
    }
    let (z, range) = *plan.get(index.checked_sub(1)?)?;
    Some(TileAddress {
        z,
        x: range.max_x,
        y: range.max_y,
    })
}

fn build_plan(levels: &[Level]) -> Vec<(u8, TileRange)> {
    levels.iter().map(|l| (l.z, compute_tile_range(l))).collect()
}

// A zoom level may appear more than once; the first matching entry wins,
// which is where the address is first generated.
fn position_of(plan: &[(u8, TileRange)], address: TileAddress) -> Option<usize> {
    plan.iter()
        .position(|(z, range)| *z == address.z && range.contains(address.x, address.y))
}
