//! Per-replica completion handling.
//!
//! Everything here runs in transport completion context: it only updates
//! counters and set state, then either finishes the set or hands it to the
//! retry worker. Nothing in this module blocks.

use std::sync::atomic::Ordering;

use tracing::{debug, error, warn};

use crate::array::ArrayCore;
use crate::error::RaidError;
use crate::pool::SetHandle;
use crate::replica::{SetFlags, SetKind, SlotIo};
use crate::retry::RetryWork;
use crate::transport::IoResult;

impl ArrayCore {
    fn update_head(&self, devnum: usize, position: u64) {
        if let Some(mirror) = self.mirrors.read().get(devnum) {
            mirror.head_position.store(position, Ordering::Relaxed);
        }
    }

    /// Whether every mirror group keeps an in-sync member if `devnum` is lost.
    pub(crate) fn enough_without(&self, devnum: usize) -> bool {
        self.covered_without(&self.mirrors.read(), Some(devnum))
    }

    /// Queues a set for the retry worker. Foreground sets keep their
    /// admission reference and are counted as queued.
    pub(crate) fn reschedule(&self, h: SetHandle, foreground: bool) {
        if foreground {
            self.barrier.inc_queued();
        }
        self.retry.push(RetryWork::Set(h));
    }

    /// Releases a foreground set, drops its admission and completes its piece.
    pub(crate) fn finish_foreground(&self, h: SetHandle) {
        let Some(set) = self.pool.release(h) else {
            return;
        };
        self.barrier.allow_barrier();
        let Some(master) = set.master else {
            return;
        };
        if !set.flags.contains(SetFlags::UPTODATE) {
            error!(
                sector = set.sector,
                sectors = set.sectors,
                kind = ?set.kind,
                "request failed on every replica"
            );
            master.fail(RaidError::Unrecoverable {
                sector: set.sector,
                sectors: set.sectors,
            });
        }
        if master.put_piece() {
            match master.kind {
                SetKind::Read => self.stats.add_reads(1),
                _ => self.stats.add_writes(1),
            }
        }
    }

    /// Finishes a foreground set with `err`.
    pub(crate) fn fail_foreground(&self, h: SetHandle, err: RaidError) {
        let master = self.pool.with(h, |set| {
            set.flags.remove(SetFlags::UPTODATE);
            set.master.clone()
        });
        if let Some(master) = master.flatten() {
            master.fail(err);
        }
        self.finish_foreground(h);
    }

    /// Completion of a foreground read.
    pub(crate) fn end_read(&self, h: SetHandle, slot: usize, result: IoResult) {
        let Some((devnum, addr, sectors, device, master, offset)) = self.pool.with(h, |set| {
            let s = &set.slots[slot];
            (
                s.devnum,
                s.addr,
                set.sectors,
                set.read_dev.clone(),
                set.master.clone(),
                set.master_offset(),
            )
        }) else {
            return;
        };
        self.update_head(devnum, addr + sectors);

        match result {
            Ok(data) => {
                if let Some(master) = &master {
                    master.fill(offset, &data);
                }
                self.pool.with(h, |set| set.flags.insert(SetFlags::UPTODATE));
                if let Some(dev) = &device {
                    dev.dec_pending();
                }
                self.finish_foreground(h);
            }
            Err(err) => {
                self.stats.add_read_errors(1);
                warn!(devnum, addr, sectors, error = %err, "replica read failed");
                if !self.enough_without(devnum) {
                    // No other replica holds this range; report instead of retrying.
                    if let Some(dev) = &device {
                        dev.dec_pending();
                    }
                    self.finish_foreground(h);
                } else {
                    // The pending reference on the device stays for the repair.
                    self.pool.with(h, |set| set.flags.insert(SetFlags::READ_ERROR));
                    self.reschedule(h, true);
                }
            }
        }
    }

    /// Completion of one replica write of a foreground set.
    pub(crate) fn end_write(&self, h: SetHandle, slot: usize, replacement: bool, result: IoResult) {
        let Some((device, addr, sectors)) = self.pool.with(h, |set| {
            let s = &set.slots[slot];
            let dev = if replacement {
                s.replacement.clone()
            } else {
                s.primary.clone()
            };
            (dev, s.addr, set.sectors)
        }) else {
            return;
        };
        let Some(dev) = device else {
            self.one_write_done(h);
            return;
        };

        let mut release = true;
        let outcome = match result {
            Err(err) => {
                self.stats.add_write_errors(1);
                warn!(device = %dev.id(), addr, sectors, error = %err, "replica write failed");
                if replacement {
                    self.fail_device(dev.id());
                } else {
                    dev.set_write_error_seen();
                    dev.set_want_replacement();
                    if !dev.is_faulty() {
                        // Keep the reference; narrowing needs the device.
                        release = false;
                        self.pool.with(h, |set| set.flags.insert(SetFlags::WRITE_ERROR));
                    } else {
                        self.pool.with(h, |set| set.flags.insert(SetFlags::DEGRADED));
                    }
                }
                SlotIo::WriteFailed
            }
            Ok(_) => {
                let uptodate = dev.is_in_sync() && !dev.is_faulty();
                let made_good = self.bad_blocks.query(dev.id(), addr, sectors).is_some();
                if made_good {
                    release = false;
                }
                self.pool.with(h, |set| {
                    if uptodate {
                        set.flags.insert(SetFlags::UPTODATE);
                    }
                    if made_good {
                        set.flags.insert(SetFlags::MADE_GOOD);
                    }
                });
                if made_good {
                    SlotIo::MadeGood
                } else {
                    SlotIo::WriteOk
                }
            }
        };
        self.pool.with(h, |set| {
            let s = &mut set.slots[slot];
            if replacement {
                s.replacement_io = outcome;
            } else {
                s.primary_io = outcome;
            }
        });
        if release {
            dev.dec_pending();
        }
        self.one_write_done(h);
    }

    /// Drops one outstanding write; the last one finishes or defers the set.
    pub(crate) fn one_write_done(&self, h: SetHandle) {
        if !self.pool.dec_remaining(h) {
            return;
        }
        let Some(flags) = self.pool.with(h, |set| set.flags) else {
            return;
        };
        if flags.contains(SetFlags::WRITE_ERROR) {
            self.reschedule(h, true);
            return;
        }
        self.close_write(h);
        if flags.contains(SetFlags::MADE_GOOD) {
            self.reschedule(h, true);
        } else {
            self.finish_foreground(h);
        }
    }

    /// Tells the bitmap the write is over. Degraded writes stay dirty.
    pub(crate) fn close_write(&self, h: SetHandle) {
        if let Some((sector, sectors, degraded)) = self.pool.with(h, |set| {
            (
                set.sector,
                set.sectors,
                set.flags.contains(SetFlags::DEGRADED),
            )
        }) {
            self.bitmap.end_write(sector, sectors, degraded);
        }
    }

    /// Completion of a resync or recovery read.
    pub(crate) fn end_sync_read(&self, h: SetHandle, slot: usize, result: IoResult) {
        let Some((devnum, addr, sectors, device, recover)) = self.pool.with(h, |set| {
            let recover = set.flags.contains(SetFlags::IS_RECOVER);
            let s = &set.slots[slot];
            let dev = if recover {
                set.read_dev.clone()
            } else {
                s.primary.clone()
            };
            (s.devnum, s.addr, set.sectors, dev, recover)
        }) else {
            return;
        };
        self.update_head(devnum, addr + sectors);

        let ok = result.is_ok();
        self.pool.with(h, |set| {
            let s = &mut set.slots[slot];
            match result {
                Ok(data) => {
                    s.data = data;
                    if !recover {
                        s.primary_io = SlotIo::ReadOk;
                    }
                    set.flags.insert(SetFlags::UPTODATE);
                }
                Err(_) => {
                    if !recover {
                        s.primary_io = SlotIo::ReadFailed;
                    }
                }
            }
        });
        if !ok {
            self.stats.add_read_errors(1);
            debug!(devnum, addr, sectors, "sync read failed");
        }
        if let Some(dev) = device {
            dev.dec_pending();
        }
        // Recovery acts on its single read at once; resync waits for all.
        if recover || self.pool.dec_remaining(h) {
            self.reschedule(h, false);
        }
    }

    /// Completion of a resync or recovery write.
    pub(crate) fn end_sync_write(
        &self,
        h: SetHandle,
        slot: usize,
        replacement: bool,
        result: IoResult,
    ) {
        let Some((device, addr, sectors)) = self.pool.with(h, |set| {
            let s = &set.slots[slot];
            let dev = if replacement {
                s.replacement.clone()
            } else {
                s.primary.clone()
            };
            (dev, s.addr, set.sectors)
        }) else {
            return;
        };
        if let Some(dev) = device {
            let outcome = match result {
                Err(err) => {
                    self.stats.add_write_errors(1);
                    warn!(device = %dev.id(), addr, sectors, error = %err, "sync write failed");
                    if replacement {
                        self.fail_device(dev.id());
                    } else {
                        dev.set_write_error_seen();
                        dev.set_want_replacement();
                        self.pool.with(h, |set| set.flags.insert(SetFlags::WRITE_ERROR));
                    }
                    SlotIo::WriteFailed
                }
                Ok(_) if self.bad_blocks.query(dev.id(), addr, sectors).is_some() => {
                    self.pool.with(h, |set| set.flags.insert(SetFlags::MADE_GOOD));
                    SlotIo::MadeGood
                }
                Ok(_) => SlotIo::WriteOk,
            };
            self.pool.with(h, |set| {
                let s = &mut set.slots[slot];
                if replacement {
                    s.replacement_io = outcome;
                } else {
                    s.primary_io = outcome;
                }
            });
            dev.dec_pending();
        }
        self.end_sync_request(h);
    }

    /// Drops one outstanding sync write; the last one finishes the chunk.
    pub(crate) fn end_sync_request(&self, h: SetHandle) {
        if !self.pool.dec_remaining(h) {
            return;
        }
        let flags = self.pool.with(h, |set| set.flags).unwrap_or_default();
        if flags.contains(SetFlags::MADE_GOOD) || flags.contains(SetFlags::WRITE_ERROR) {
            self.reschedule(h, false);
        } else {
            self.sync_set_done(h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::tests::mem_array;
    use crate::device::DeviceId;
    use crate::geometry::SECTOR_SIZE;
    use crate::transport::FaultRule;
    use bytes::Bytes;

    #[test]
    fn test_enough_without() {
        let (array, _t, _bb) = mem_array(4);
        let core = array.core();
        assert!(core.enough_without(0));
        array.fail_device(DeviceId(1));
        assert!(!core.enough_without(0));
        assert!(core.enough_without(2));
    }

    #[test]
    fn test_read_error_on_last_copy_is_reported() {
        let (array, transport, _bb) = mem_array(4);
        array.fail_device(DeviceId(1));
        transport.inject(FaultRule::read(DeviceId(0), 0, 64));
        let err = array.read(0, 8).unwrap_err();
        assert!(matches!(err, RaidError::Unrecoverable { .. }));
        assert_eq!(array.barrier_state().nr_pending, 0);
    }

    #[test]
    fn test_write_to_all_faulty_mirror_fails() {
        let (array, transport, _bb) = mem_array(4);
        transport.inject(FaultRule::write(DeviceId(2), 0, 1 << 20));
        array.fail_device(DeviceId(3));
        let chunk = array.geometry().chunk_sectors();
        // Chunk 1 lives on devices 2 and 3.
        let err = array
            .write(chunk, Bytes::from(vec![1u8; 8 * SECTOR_SIZE]))
            .unwrap_err();
        assert!(matches!(err, RaidError::Unrecoverable { .. }));
        let dev2 = array.device(DeviceId(2)).unwrap();
        assert!(dev2.write_error_seen());
        assert_eq!(dev2.nr_pending(), 0);
    }
}
