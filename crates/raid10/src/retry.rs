//! Retry and repair worker.
//!
//! A single thread drains a FIFO of deferred replica sets. It is the only
//! place that blocks on synchronous device I/O: read-error repair under a
//! frozen array, write-error narrowing into bad-block ranges, clearing of
//! bad blocks that were written successfully, sync writes and read
//! continuations left over from bad-block splits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::array::ArrayCore;
use crate::device::Device;
use crate::dispatch::ReadContext;
use crate::geometry::{PAGE_SECTORS, SECTOR_SIZE};
use crate::pool::SetHandle;
use crate::replica::{ReplicaSlot, SetFlags, SetKind, SlotIo};
use crate::transport::{sync_io, IoDirection, IoRequest};

/// Work item for the retry worker.
#[derive(Debug)]
pub(crate) enum RetryWork {
    /// A set whose state bits say what to do next.
    Set(SetHandle),
    /// Remainder of a read cut short by a bad block.
    ReadContinue(SetHandle),
    /// Stop the worker.
    Shutdown,
}

/// FIFO feeding the worker. Pushing never blocks.
pub(crate) struct RetryQueue {
    tx: mpsc::UnboundedSender<RetryWork>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RetryWork>>>,
    depth: AtomicUsize,
}

impl RetryQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            depth: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, work: RetryWork) {
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(work).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            error!("retry worker gone, deferred work dropped");
        }
    }

    /// Items queued and not yet picked up.
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

/// Starts the worker thread. It runs until [`RetryWork::Shutdown`].
pub(crate) fn spawn_worker(core: Arc<ArrayCore>) -> std::io::Result<JoinHandle<()>> {
    let mut rx = core.retry.rx.lock().take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AlreadyExists, "retry worker already started")
    })?;
    std::thread::Builder::new()
        .name("raid10-retry".to_string())
        .spawn(move || {
            debug!("retry worker started");
            while let Some(work) = rx.blocking_recv() {
                core.retry.depth.fetch_sub(1, Ordering::AcqRel);
                match work {
                    RetryWork::Shutdown => break,
                    RetryWork::ReadContinue(h) => {
                        core.barrier.dec_queued();
                        core.issue_read(h, ReadContext::Worker);
                    }
                    RetryWork::Set(h) => core.process_set(h),
                }
            }
            debug!("retry worker stopped");
        })
}

/// Result of a synchronous page I/O during repair.
#[derive(Debug)]
enum PageIo {
    Done(Bytes),
    Failed,
    Skipped,
}

impl ArrayCore {
    fn process_set(self: &Arc<Self>, h: SetHandle) {
        let Some((kind, flags)) = self.pool.with(h, |set| (set.kind, set.flags)) else {
            return;
        };
        if kind != SetKind::Sync {
            self.barrier.dec_queued();
        }
        self.stats.add_retries(1);
        if flags.contains(SetFlags::MADE_GOOD) || flags.contains(SetFlags::WRITE_ERROR) {
            self.handle_write_completed(h, kind);
        } else if flags.contains(SetFlags::IS_RECOVER) {
            self.recovery_request_write(h);
        } else if flags.contains(SetFlags::IS_SYNC) {
            self.sync_request_write(h);
        } else if flags.contains(SetFlags::READ_ERROR) {
            self.handle_read_error(h);
        } else {
            warn!(index = h.index(), ?flags, "retry of set with nothing to do");
        }
    }

    fn live_rdev(&self, devnum: usize) -> Option<Arc<Device>> {
        self.mirrors
            .read()
            .get(devnum)
            .and_then(|m| m.live_rdev().cloned())
    }

    /// Records a bad range, failing the device when it cannot be recorded.
    pub(crate) fn set_badblocks(&self, dev: &Device, sector: u64, sectors: u64) -> bool {
        if self.bad_blocks.set_bad(dev.id(), sector, sectors) {
            self.stats.add_bad_blocks_recorded(1);
            true
        } else {
            self.fail_device(dev.id());
            false
        }
    }

    /// Synchronous page I/O used while repairing. Failures are recorded as
    /// bad blocks on `dev`.
    fn sync_page_io(
        &self,
        dev: &Device,
        sector: u64,
        sectors: u64,
        direction: IoDirection,
        data: &Bytes,
    ) -> PageIo {
        if self.bad_blocks.query(dev.id(), sector, sectors).is_some()
            && (direction == IoDirection::Read || dev.write_error_seen())
        {
            return PageIo::Skipped;
        }
        let req = match direction {
            IoDirection::Read => IoRequest::read(dev.id(), sector, sectors),
            IoDirection::Write => IoRequest::write(dev.id(), sector, data.clone()),
        };
        dev.inc_pending();
        let result = sync_io(self.transport.as_ref(), req);
        dev.dec_pending();
        match result {
            Ok(bytes) => PageIo::Done(bytes),
            Err(err) => {
                warn!(device = %dev.id(), sector, sectors, ?direction, error = %err, "repair I/O failed");
                if direction == IoDirection::Write {
                    dev.set_write_error_seen();
                    dev.set_want_replacement();
                }
                self.set_badblocks(dev, sector, sectors);
                PageIo::Failed
            }
        }
    }

    fn handle_read_error(self: &Arc<Self>, h: SetHandle) {
        let device = self.pool.with(h, |set| set.read_dev.clone()).flatten();
        self.barrier.freeze_array(1);
        self.fix_read_error(h);
        self.barrier.unfreeze_array();
        if let Some(dev) = device {
            dev.dec_pending();
        }
        self.pool.with(h, |set| {
            set.flags = SetFlags::default();
            set.read_dev = None;
            set.read_slot = None;
        });
        self.issue_read(h, ReadContext::Worker);
    }

    /// Rewrites the failed range from another replica, page by page.
    fn fix_read_error(&self, h: SetHandle) {
        let Some((slots, read_slot, sectors)) = self
            .pool
            .with(h, |set| (set.slots.clone(), set.read_slot, set.sectors))
        else {
            return;
        };
        let Some(read_slot) = read_slot else {
            return;
        };
        let copies = slots.len();
        let Some(failed) = self.live_rdev(slots[read_slot].devnum) else {
            return;
        };

        let errors = failed.record_read_error(Instant::now());
        if errors > self.config.max_read_errors {
            error!(
                device = %failed.id(),
                errors,
                limit = self.config.max_read_errors,
                "read error threshold exceeded, failing device"
            );
            self.fail_device(failed.id());
            self.block_slot(h, read_slot);
            return;
        }

        let mut sect = 0;
        let mut left = sectors;
        while left > 0 {
            let s = left.min(PAGE_SECTORS);
            let mut sl = read_slot;
            let mut good: Option<Bytes> = None;
            loop {
                if let Some(rdev) = self.readable(&slots[sl], sect, s) {
                    let req = IoRequest::read(rdev.id(), slots[sl].addr + sect, s);
                    rdev.inc_pending();
                    let result = sync_io(self.transport.as_ref(), req);
                    rdev.dec_pending();
                    if let Ok(data) = result {
                        good = Some(data);
                        break;
                    }
                }
                sl = (sl + 1) % copies;
                if sl == read_slot {
                    break;
                }
            }

            let Some(data) = good else {
                // Nothing could read it; keep future reads off the original.
                warn!(device = %failed.id(), sector = slots[read_slot].addr + sect, s, "unreadable on every replica");
                if !self.set_badblocks(&failed, slots[read_slot].addr + sect, s) {
                    self.block_slot(h, read_slot);
                }
                break;
            };

            // Write back to every replica tried before the good one.
            let start = sl;
            while sl != read_slot {
                sl = (sl + copies - 1) % copies;
                if let Some(rdev) = self.in_sync_rdev(slots[sl].devnum) {
                    if let PageIo::Failed =
                        self.sync_page_io(&rdev, slots[sl].addr + sect, s, IoDirection::Write, &data)
                    {
                        warn!(device = %rdev.id(), "rewrite after read error failed");
                    }
                }
            }
            sl = start;
            while sl != read_slot {
                sl = (sl + copies - 1) % copies;
                if let Some(rdev) = self.in_sync_rdev(slots[sl].devnum) {
                    match self.sync_page_io(&rdev, slots[sl].addr + sect, s, IoDirection::Read, &data) {
                        PageIo::Done(_) => {
                            info!(
                                device = %rdev.id(),
                                sector = slots[sl].addr + sect,
                                sectors = s,
                                "read error corrected"
                            );
                            rdev.add_corrected(s);
                            self.stats.add_corrected_reads(s);
                        }
                        PageIo::Failed => {
                            warn!(device = %rdev.id(), "re-read after rewrite failed");
                        }
                        PageIo::Skipped => {}
                    }
                }
            }
            left -= s;
            sect += s;
        }
    }

    fn in_sync_rdev(&self, devnum: usize) -> Option<Arc<Device>> {
        self.live_rdev(devnum).filter(|d| d.is_in_sync())
    }

    fn readable(&self, slot: &ReplicaSlot, sect: u64, s: u64) -> Option<Arc<Device>> {
        self.in_sync_rdev(slot.devnum)
            .filter(|d| self.bad_blocks.query(d.id(), slot.addr + sect, s).is_none())
    }

    fn block_slot(&self, h: SetHandle, slot: usize) {
        self.pool.with(h, |set| set.slots[slot].io_blocked = true);
    }

    /// Deals with failed or made-good replica writes once a set is complete.
    fn handle_write_completed(self: &Arc<Self>, h: SetHandle, kind: SetKind) {
        let Some((slots, sectors, payload, flags)) = self
            .pool
            .with(h, |set| (set.slots.clone(), set.sectors, set.payload.clone(), set.flags))
        else {
            return;
        };

        if kind == SetKind::Sync {
            for slot in &slots {
                for (dev, io) in [
                    (&slot.primary, slot.primary_io),
                    (&slot.replacement, slot.replacement_io),
                ] {
                    let Some(dev) = dev else { continue };
                    match io {
                        SlotIo::WriteFailed => {
                            self.set_badblocks(dev, slot.addr, sectors);
                        }
                        SlotIo::MadeGood => self.clear_badblocks(dev, slot.addr, sectors),
                        _ => {}
                    }
                }
            }
            self.sync_set_done(h);
            return;
        }

        let mut uptodate = false;
        for slot in &slots {
            if let Some(dev) = &slot.primary {
                match slot.primary_io {
                    SlotIo::MadeGood => {
                        self.clear_badblocks(dev, slot.addr, sectors);
                        dev.dec_pending();
                    }
                    SlotIo::WriteFailed if !dev.is_faulty() => {
                        let narrowed = self.narrow_write_error(dev, slot.addr, &payload);
                        if !narrowed.recorded {
                            self.fail_device(dev.id());
                        }
                        uptodate |= narrowed.fully_written && dev.is_in_sync();
                        dev.dec_pending();
                    }
                    SlotIo::WriteFailed => dev.dec_pending(),
                    _ => {}
                }
            }
            if let (Some(dev), SlotIo::MadeGood) = (&slot.replacement, slot.replacement_io) {
                self.clear_badblocks(dev, slot.addr, sectors);
                dev.dec_pending();
            }
        }
        if uptodate {
            self.pool.with(h, |set| set.flags.insert(SetFlags::UPTODATE));
        }
        if flags.contains(SetFlags::WRITE_ERROR) {
            self.close_write(h);
        }
        self.finish_foreground(h);
    }

    fn clear_badblocks(&self, dev: &Device, sector: u64, sectors: u64) {
        self.bad_blocks.clear(dev.id(), sector, sectors);
        self.stats.add_bad_blocks_cleared(1);
        debug!(device = %dev.id(), sector, sectors, "bad range written good");
    }

    /// Retries a failed write in bad-block-sized pieces, recording each piece
    /// that still fails.
    fn narrow_write_error(&self, dev: &Device, addr: u64, payload: &Bytes) -> Narrowed {
        let Some(shift) = self.bad_blocks.block_shift(dev.id()) else {
            return Narrowed {
                recorded: false,
                fully_written: false,
            };
        };
        let block_sectors = 1u64 << shift;
        let total = (payload.len() / SECTOR_SIZE) as u64;
        let mut sector = addr;
        let mut left = total;
        let mut recorded = true;
        let mut fully_written = true;
        // The first piece runs up to the next block boundary.
        let mut piece = ((addr + block_sectors) & !(block_sectors - 1)) - addr;
        while left > 0 {
            let len = piece.min(left);
            let off = (sector - addr) as usize * SECTOR_SIZE;
            let data = payload.slice(off..off + len as usize * SECTOR_SIZE);
            if sync_io(self.transport.as_ref(), IoRequest::write(dev.id(), sector, data)).is_err() {
                fully_written = false;
                if self.bad_blocks.set_bad(dev.id(), sector, len) {
                    self.stats.add_bad_blocks_recorded(1);
                } else {
                    recorded = false;
                }
            }
            left -= len;
            sector += len;
            piece = block_sectors;
        }
        info!(device = %dev.id(), addr, sectors = total, recorded, fully_written, "write error narrowed");
        Narrowed {
            recorded,
            fully_written,
        }
    }
}

struct Narrowed {
    recorded: bool,
    fully_written: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::tests::mem_array;
    use crate::badblocks::{BadBlockOracle, BadRange};
    use crate::device::DeviceId;
    use crate::transport::FaultRule;

    #[test]
    fn test_queue_depth() {
        let queue = RetryQueue::new();
        queue.push(RetryWork::Shutdown);
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_transient_read_error_is_repaired() {
        let (array, transport, _bb) = mem_array(4);
        let data = Bytes::from(vec![0x5Au8; 8 * SECTOR_SIZE]);
        array.write(500, data.clone()).unwrap();
        // Fails the balanced read and the first repair read on device 0.
        transport.inject(FaultRule::read(DeviceId(0), 500, 8).times(2));
        transport.clear_log();
        assert_eq!(array.read(500, 8).unwrap(), data);
        let rewrote = transport
            .log()
            .iter()
            .any(|r| r.device == DeviceId(0) && r.direction == IoDirection::Write && r.ok);
        assert!(rewrote);
        assert_eq!(array.device(DeviceId(0)).unwrap().corrected_errors(), 8);
        assert_eq!(array.stats().corrected_reads, 8);
        assert_eq!(array.barrier_state().nr_queued, 0);
    }

    #[test]
    fn test_read_error_threshold_fails_device() {
        let (array, transport, _bb) = mem_array(4);
        let dev0 = array.device(DeviceId(0)).unwrap();
        for _ in 0..20 {
            dev0.record_read_error(Instant::now());
        }
        transport.inject(FaultRule::read(DeviceId(0), 0, 64).times(1));
        // Served by device 1 after device 0 is failed.
        assert!(array.read(0, 8).is_ok());
        assert!(dev0.is_faulty());
        assert_eq!(array.stats().devices_failed, 1);
    }

    #[test]
    fn test_write_error_is_narrowed_into_bad_blocks() {
        let (array, transport, bb) = mem_array(4);
        transport.inject(FaultRule::write(DeviceId(1), 12, 2));
        array
            .write(8, Bytes::from(vec![1u8; 8 * SECTOR_SIZE]))
            .unwrap();
        let dev1 = array.device(DeviceId(1)).unwrap();
        assert!(dev1.write_error_seen());
        assert!(!dev1.is_faulty());
        assert_eq!(
            bb.ranges(DeviceId(1)),
            vec![BadRange {
                first_bad: 12,
                sectors: 2
            }]
        );
        assert_eq!(dev1.nr_pending(), 0);
    }

    #[test]
    fn test_made_good_clears_bad_range() {
        let (array, _transport, bb) = mem_array(4);
        bb.set_bad(DeviceId(0), 40, 4);
        array
            .write(40, Bytes::from(vec![2u8; 4 * SECTOR_SIZE]))
            .unwrap();
        assert!(bb.query(DeviceId(0), 40, 4).is_none());
        assert_eq!(array.stats().bad_blocks_cleared, 1);
    }
}
