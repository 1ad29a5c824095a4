//! Per-device bad-block ranges.
//!
//! The array never owns bad-block persistence. It consults a
//! [`BadBlockOracle`] before reading or writing a range and records ranges it
//! has proven unusable. [`MemBadBlocks`] is the in-memory table used by tests
//! and by embedders without persistent metadata.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::DeviceId;

/// Maximum number of ranges tracked per device.
pub const MAX_BAD_RANGES: usize = 512;

/// A bad range overlapping a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadRange {
    /// First bad sector.
    pub first_bad: u64,
    /// Length of the bad run in sectors.
    pub sectors: u64,
}

/// Bad-block lookup and recording, atomic per call.
pub trait BadBlockOracle: Send + Sync {
    /// Returns the first bad range overlapping `[sector, sector + sectors)`.
    fn query(&self, device: DeviceId, sector: u64, sectors: u64) -> Option<BadRange>;

    /// Records a bad range. Returns false when it could not be recorded.
    fn set_bad(&self, device: DeviceId, sector: u64, sectors: u64) -> bool;

    /// Forgets any bad sectors inside the range.
    fn clear(&self, device: DeviceId, sector: u64, sectors: u64);

    /// Alignment of recorded ranges as a power-of-two shift, or `None` when
    /// bad-block tracking is disabled for the device.
    fn block_shift(&self, device: DeviceId) -> Option<u32>;
}

/// In-memory bad-block table.
#[derive(Debug)]
pub struct MemBadBlocks {
    shift: Option<u32>,
    capacity: usize,
    tables: DashMap<DeviceId, BTreeMap<u64, u64>>,
}

impl MemBadBlocks {
    /// Creates a table aligned to single sectors.
    pub fn new() -> Self {
        Self::with_shift(Some(0))
    }

    /// Creates a table with the given alignment shift (`None` disables it).
    pub fn with_shift(shift: Option<u32>) -> Self {
        Self {
            shift,
            capacity: MAX_BAD_RANGES,
            tables: DashMap::new(),
        }
    }

    /// Limits the number of ranges per device.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Every range recorded for `device`, in order.
    pub fn ranges(&self, device: DeviceId) -> Vec<BadRange> {
        self.tables
            .get(&device)
            .map(|t| {
                t.iter()
                    .map(|(&start, &end)| BadRange {
                        first_bad: start,
                        sectors: end - start,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn align_out(&self, sector: u64, sectors: u64) -> (u64, u64) {
        let mask = (1u64 << self.shift.unwrap_or(0)) - 1;
        let start = sector & !mask;
        let end = (sector + sectors + mask) & !mask;
        (start, end)
    }

    fn align_in(&self, sector: u64, sectors: u64) -> (u64, u64) {
        let mask = (1u64 << self.shift.unwrap_or(0)) - 1;
        let start = (sector + mask) & !mask;
        let end = (sector + sectors) & !mask;
        (start, end)
    }
}

impl Default for MemBadBlocks {
    fn default() -> Self {
        Self::new()
    }
}

impl BadBlockOracle for MemBadBlocks {
    fn query(&self, device: DeviceId, sector: u64, sectors: u64) -> Option<BadRange> {
        let table = self.tables.get(&device)?;
        let end = sector + sectors;
        // The range starting at or before `sector` may reach into the query.
        if let Some((&start, &stop)) = table.range(..=sector).next_back() {
            if stop > sector {
                return Some(BadRange {
                    first_bad: start,
                    sectors: stop - start,
                });
            }
        }
        table
            .range(sector..end)
            .next()
            .map(|(&start, &stop)| BadRange {
                first_bad: start,
                sectors: stop - start,
            })
    }

    fn set_bad(&self, device: DeviceId, sector: u64, sectors: u64) -> bool {
        if self.shift.is_none() || sectors == 0 {
            return false;
        }
        let (mut start, mut end) = self.align_out(sector, sectors);
        let mut table = self.tables.entry(device).or_default();

        // Absorb every range touching [start, end).
        let touching: Vec<(u64, u64)> = table
            .range(..=end)
            .rev()
            .take_while(|(_, &stop)| stop >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        if touching.is_empty() && table.len() >= self.capacity {
            warn!(device = %device, sector, sectors, "bad block table full");
            return false;
        }
        for (s, e) in touching {
            table.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        table.insert(start, end);
        debug!(device = %device, start, end, "recorded bad range");
        true
    }

    fn clear(&self, device: DeviceId, sector: u64, sectors: u64) {
        let (start, end) = self.align_in(sector, sectors);
        if start >= end {
            return;
        }
        let Some(mut table) = self.tables.get_mut(&device) else {
            return;
        };
        let overlapping: Vec<(u64, u64)> = table
            .range(..end)
            .rev()
            .take_while(|(_, &stop)| stop > start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            table.remove(&s);
            if s < start {
                table.insert(s, start);
            }
            if e > end {
                table.insert(end, e);
            }
        }
        debug!(device = %device, start, end, "cleared bad range");
    }

    fn block_shift(&self, _device: DeviceId) -> Option<u32> {
        self.shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: DeviceId = DeviceId(1);

    #[test]
    fn test_query_empty() {
        let bb = MemBadBlocks::new();
        assert_eq!(bb.query(D, 0, 100), None);
    }

    #[test]
    fn test_query_overlap_start_and_inside() {
        let bb = MemBadBlocks::new();
        assert!(bb.set_bad(D, 200, 10));
        assert_eq!(
            bb.query(D, 190, 30),
            Some(BadRange {
                first_bad: 200,
                sectors: 10
            })
        );
        assert_eq!(
            bb.query(D, 205, 30),
            Some(BadRange {
                first_bad: 200,
                sectors: 10
            })
        );
        assert_eq!(bb.query(D, 210, 30), None);
        assert_eq!(bb.query(D, 190, 10), None);
        assert_eq!(bb.query(DeviceId(2), 200, 10), None);
    }

    #[test]
    fn test_set_merges_adjacent() {
        let bb = MemBadBlocks::new();
        bb.set_bad(D, 10, 5);
        bb.set_bad(D, 15, 5);
        bb.set_bad(D, 30, 5);
        bb.set_bad(D, 18, 14);
        assert_eq!(
            bb.ranges(D),
            vec![BadRange {
                first_bad: 10,
                sectors: 25
            }]
        );
    }

    #[test]
    fn test_clear_splits_range() {
        let bb = MemBadBlocks::new();
        bb.set_bad(D, 100, 50);
        bb.clear(D, 120, 10);
        assert_eq!(
            bb.ranges(D),
            vec![
                BadRange {
                    first_bad: 100,
                    sectors: 20
                },
                BadRange {
                    first_bad: 130,
                    sectors: 20
                }
            ]
        );
    }

    #[test]
    fn test_alignment_rounds_set_out_and_clear_in() {
        let bb = MemBadBlocks::with_shift(Some(3));
        bb.set_bad(D, 10, 1);
        assert_eq!(
            bb.ranges(D),
            vec![BadRange {
                first_bad: 8,
                sectors: 8
            }]
        );
        // Partial block clears leave the block recorded.
        bb.clear(D, 9, 6);
        assert_eq!(bb.ranges(D).len(), 1);
        bb.clear(D, 8, 8);
        assert!(bb.ranges(D).is_empty());
    }

    #[test]
    fn test_disabled_and_full_table() {
        let disabled = MemBadBlocks::with_shift(None);
        assert!(!disabled.set_bad(D, 0, 8));
        assert_eq!(disabled.block_shift(D), None);

        let small = MemBadBlocks::new().with_capacity(2);
        assert!(small.set_bad(D, 0, 1));
        assert!(small.set_bad(D, 10, 1));
        assert!(!small.set_bad(D, 20, 1));
        // Extending an existing range still succeeds.
        assert!(small.set_bad(D, 1, 1));
    }
}
