//! Array counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters updated from dispatch, completion and the worker.
#[derive(Debug, Default)]
pub struct RaidStats {
    reads: AtomicU64,
    writes: AtomicU64,
    read_errors: AtomicU64,
    corrected_reads: AtomicU64,
    write_errors: AtomicU64,
    bad_blocks_recorded: AtomicU64,
    bad_blocks_cleared: AtomicU64,
    resync_mismatches: AtomicU64,
    sync_sectors: AtomicU64,
    retries: AtomicU64,
    devices_failed: AtomicU64,
    write_restarts: AtomicU64,
}

/// Point-in-time copy of [`RaidStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidStatsSnapshot {
    /// Logical reads completed.
    pub reads: u64,
    /// Logical writes completed.
    pub writes: u64,
    /// Replica read failures observed.
    pub read_errors: u64,
    /// Sectors rewritten after a read error.
    pub corrected_reads: u64,
    /// Replica write failures observed.
    pub write_errors: u64,
    /// Bad ranges recorded with the oracle.
    pub bad_blocks_recorded: u64,
    /// Bad ranges cleared after successful writes.
    pub bad_blocks_cleared: u64,
    /// Sectors found to differ during resync or check.
    pub resync_mismatches: u64,
    /// Sectors processed by resync and recovery.
    pub sync_sectors: u64,
    /// Sets handled by the retry worker.
    pub retries: u64,
    /// Devices failed by the array.
    pub devices_failed: u64,
    /// Writes restarted because a device was blocked.
    pub write_restarts: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl RaidStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    counters! {
        add_reads => reads,
        add_writes => writes,
        add_read_errors => read_errors,
        add_corrected_reads => corrected_reads,
        add_write_errors => write_errors,
        add_bad_blocks_recorded => bad_blocks_recorded,
        add_bad_blocks_cleared => bad_blocks_cleared,
        add_resync_mismatches => resync_mismatches,
        add_sync_sectors => sync_sectors,
        add_retries => retries,
        add_devices_failed => devices_failed,
        add_write_restarts => write_restarts,
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> RaidStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RaidStatsSnapshot {
            reads: get(&self.reads),
            writes: get(&self.writes),
            read_errors: get(&self.read_errors),
            corrected_reads: get(&self.corrected_reads),
            write_errors: get(&self.write_errors),
            bad_blocks_recorded: get(&self.bad_blocks_recorded),
            bad_blocks_cleared: get(&self.bad_blocks_cleared),
            resync_mismatches: get(&self.resync_mismatches),
            sync_sectors: get(&self.sync_sectors),
            retries: get(&self.retries),
            devices_failed: get(&self.devices_failed),
            write_restarts: get(&self.write_restarts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RaidStats::new();
        stats.add_reads(2);
        stats.add_reads(3);
        stats.add_resync_mismatches(8);
        let snap = stats.snapshot();
        assert_eq!(snap.reads, 5);
        assert_eq!(snap.resync_mismatches, 8);
        assert_eq!(snap.writes, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RaidStats::new();
        stats.add_devices_failed(1);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"devices_failed\":1"));
        let back: RaidStatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats.snapshot());
    }
}
