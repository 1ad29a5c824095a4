//! Write-intent bitmap interface.
//!
//! The bitmap records which regions may differ between replicas so that
//! resync and re-add recovery can skip clean regions. The array reports
//! write start/end and sync start/end; the service decides what is dirty.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Sync window reported when no bitmap is present.
pub const NO_BITMAP_SYNC_SECTORS: u64 = 1024;

/// Dirty-region tracking consumed by the array.
pub trait WriteIntentBitmap: Send + Sync {
    /// A write to `[sector, sector + sectors)` is about to start.
    fn start_write(&self, sector: u64, sectors: u64);

    /// A write has finished. `degraded` writes missed at least one replica,
    /// so their region must stay dirty.
    fn end_write(&self, sector: u64, sectors: u64, degraded: bool);

    /// Asks whether the region at `sector` needs sync. Returns the answer and
    /// the number of sectors it applies to.
    fn start_sync(&self, sector: u64) -> (bool, u64);

    /// Sync of `[sector, sector + sectors)` landed on every replica.
    fn end_sync(&self, sector: u64, sectors: u64);

    /// A window at `[sector, sector + sectors)` could not be synced; its
    /// chunk must stay dirty even if later windows succeed.
    fn abort_sync(&self, sector: u64, sectors: u64);

    /// The sync pass is over. Chunks it claimed without finishing stay dirty
    /// and are released to writes again.
    fn close_sync(&self);

    /// Whether a real bitmap backs this service.
    fn is_present(&self) -> bool {
        true
    }
}

/// Stand-in used when the array has no bitmap: everything needs sync.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBitmap;

impl WriteIntentBitmap for NoBitmap {
    fn start_write(&self, _sector: u64, _sectors: u64) {}

    fn end_write(&self, _sector: u64, _sectors: u64, _degraded: bool) {}

    fn start_sync(&self, _sector: u64) -> (bool, u64) {
        (true, NO_BITMAP_SYNC_SECTORS)
    }

    fn end_sync(&self, _sector: u64, _sectors: u64) {}

    fn abort_sync(&self, _sector: u64, _sectors: u64) {}

    fn close_sync(&self) {}

    fn is_present(&self) -> bool {
        false
    }
}

/// State of one bitmap chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkState {
    /// Writes in flight.
    pub pending: u32,
    /// Replicas may differ.
    pub needed: bool,
    /// A sync pass has claimed the chunk.
    pub syncing: bool,
    /// Some window of the claiming pass failed.
    pub aborted: bool,
}

/// In-memory bitmap with a fixed chunk size.
#[derive(Debug)]
pub struct MemBitmap {
    chunk_shift: u32,
    chunks: Mutex<Vec<ChunkState>>,
}

impl MemBitmap {
    /// Creates a clean bitmap covering `array_sectors` in chunks of
    /// `chunk_sectors` (rounded up to a power of two).
    pub fn new(chunk_sectors: u64, array_sectors: u64) -> Self {
        let chunk_sectors = chunk_sectors.max(1).next_power_of_two();
        let chunk_shift = chunk_sectors.trailing_zeros();
        let count = array_sectors.div_ceil(chunk_sectors) as usize;
        Self {
            chunk_shift,
            chunks: Mutex::new(vec![ChunkState::default(); count]),
        }
    }

    /// Chunk size in sectors.
    pub fn chunk_sectors(&self) -> u64 {
        1 << self.chunk_shift
    }

    /// Marks every chunk as needing sync.
    pub fn mark_all_dirty(&self) {
        for chunk in self.chunks.lock().iter_mut() {
            chunk.needed = true;
        }
    }

    /// Snapshot of the chunk containing `sector`.
    pub fn chunk_state(&self, sector: u64) -> ChunkState {
        let idx = (sector >> self.chunk_shift) as usize;
        self.chunks.lock().get(idx).copied().unwrap_or_default()
    }

    /// Number of chunks needing sync.
    pub fn dirty_chunks(&self) -> usize {
        self.chunks.lock().iter().filter(|c| c.needed).count()
    }

    fn chunk_range(&self, sector: u64, sectors: u64) -> std::ops::Range<usize> {
        let first = (sector >> self.chunk_shift) as usize;
        let last = ((sector + sectors.max(1) - 1) >> self.chunk_shift) as usize;
        first..last + 1
    }
}

impl WriteIntentBitmap for MemBitmap {
    fn start_write(&self, sector: u64, sectors: u64) {
        let range = self.chunk_range(sector, sectors);
        let mut chunks = self.chunks.lock();
        for chunk in chunks.get_mut(range).into_iter().flatten() {
            chunk.pending += 1;
            chunk.needed = true;
        }
    }

    fn end_write(&self, sector: u64, sectors: u64, degraded: bool) {
        let range = self.chunk_range(sector, sectors);
        let mut chunks = self.chunks.lock();
        for chunk in chunks.get_mut(range).into_iter().flatten() {
            chunk.pending = chunk.pending.saturating_sub(1);
            if chunk.pending == 0 && !degraded && !chunk.syncing {
                chunk.needed = false;
            }
        }
    }

    fn start_sync(&self, sector: u64) -> (bool, u64) {
        let idx = (sector >> self.chunk_shift) as usize;
        let rest = self.chunk_sectors() - (sector & (self.chunk_sectors() - 1));
        let mut chunks = self.chunks.lock();
        match chunks.get_mut(idx) {
            Some(chunk) if chunk.syncing => (true, rest),
            Some(chunk) if chunk.needed => {
                chunk.syncing = true;
                (true, rest)
            }
            _ => (false, rest),
        }
    }

    fn end_sync(&self, sector: u64, sectors: u64) {
        let idx = ((sector + sectors.max(1) - 1) >> self.chunk_shift) as usize;
        let chunk_end = ((idx as u64) + 1) << self.chunk_shift;
        let mut chunks = self.chunks.lock();
        if let Some(chunk) = chunks.get_mut(idx) {
            // Only the piece reaching the chunk end closes the chunk.
            if sector + sectors >= chunk_end && chunk.syncing {
                chunk.syncing = false;
                if chunk.pending == 0 && !chunk.aborted {
                    chunk.needed = false;
                }
                chunk.aborted = false;
            }
        }
    }

    fn abort_sync(&self, sector: u64, sectors: u64) {
        let range = self.chunk_range(sector, sectors);
        let mut chunks = self.chunks.lock();
        for chunk in chunks.get_mut(range).into_iter().flatten() {
            if chunk.syncing {
                chunk.aborted = true;
            }
        }
    }

    fn close_sync(&self) {
        for chunk in self.chunks.lock().iter_mut() {
            if chunk.syncing {
                chunk.syncing = false;
                chunk.aborted = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_bitmap_always_needs_sync() {
        let bm = NoBitmap;
        assert_eq!(bm.start_sync(12345), (true, NO_BITMAP_SYNC_SECTORS));
        assert!(!bm.is_present());
    }

    #[test]
    fn test_clean_write_clears_chunk() {
        let bm = MemBitmap::new(128, 1024);
        bm.start_write(10, 8);
        assert!(bm.chunk_state(10).needed);
        assert_eq!(bm.chunk_state(10).pending, 1);
        bm.end_write(10, 8, false);
        assert!(!bm.chunk_state(10).needed);
    }

    #[test]
    fn test_degraded_write_stays_dirty() {
        let bm = MemBitmap::new(128, 1024);
        bm.start_write(120, 16);
        bm.end_write(120, 16, true);
        assert!(bm.chunk_state(0).needed);
        assert!(bm.chunk_state(128).needed);
        assert_eq!(bm.dirty_chunks(), 2);
    }

    #[test]
    fn test_sync_claims_and_releases_chunk() {
        let bm = MemBitmap::new(128, 1024);
        assert_eq!(bm.start_sync(0), (false, 128));
        bm.mark_all_dirty();
        assert_eq!(bm.start_sync(64), (true, 64));
        assert!(bm.chunk_state(64).syncing);
        // First half does not close the chunk.
        bm.end_sync(0, 64);
        assert!(bm.chunk_state(0).needed);
        assert_eq!(bm.start_sync(64), (true, 64));
        bm.end_sync(64, 64);
        let state = bm.chunk_state(0);
        assert!(!state.needed);
        assert!(!state.syncing);
    }

    #[test]
    fn test_aborted_window_keeps_chunk_dirty() {
        let bm = MemBitmap::new(128, 1024);
        bm.mark_all_dirty();
        assert_eq!(bm.start_sync(0), (true, 128));
        bm.abort_sync(0, 64);
        assert_eq!(bm.start_sync(64), (true, 64));
        bm.end_sync(64, 64);
        let state = bm.chunk_state(0);
        assert!(state.needed);
        assert!(!state.syncing);
        assert!(!state.aborted);
    }

    #[test]
    fn test_close_sync_releases_claimed_chunks() {
        let bm = MemBitmap::new(128, 1024);
        bm.mark_all_dirty();
        bm.start_sync(0);
        bm.start_sync(256);
        bm.close_sync();
        assert!(!bm.chunk_state(0).syncing);
        assert!(bm.chunk_state(256).needed);

        // Writes can clean the chunk again once the pass is gone.
        bm.start_write(0, 8);
        bm.end_write(0, 8, false);
        assert!(!bm.chunk_state(0).needed);
        assert_eq!(bm.dirty_chunks(), 7);
    }
}
