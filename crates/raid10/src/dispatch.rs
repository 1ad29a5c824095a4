//! Foreground request dispatch.
//!
//! Logical requests are cut at chunk boundaries (unless every device holds
//! every chunk) and each piece becomes one replica set. Reads go to the
//! replica picked by the balancer and are cut again where a bad block ends
//! the readable prefix. Writes go to every live replica in waves clamped so
//! that no replica writes into a range already known bad.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::array::ArrayCore;
use crate::device::Device;
use crate::error::{RaidError, RaidResult};
use crate::geometry::SECTOR_SIZE;
use crate::pool::SetHandle;
use crate::replica::{MasterRequest, ReplicaSet, ReplicaSlot, RequestDone, SetFlags, SetKind, SlotIo};
use crate::retry::RetryWork;
use crate::transport::IoRequest;

/// Where a read is issued from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadContext {
    /// The submitting thread, which loops over the remainder itself.
    Caller,
    /// The retry worker, which queues the remainder as a continuation.
    Worker,
}

impl ArrayCore {
    fn check_range(&self, sector: u64, sectors: u64) -> RaidResult<()> {
        let array_sectors = self.geo.array_sectors();
        if sectors == 0 || sector.checked_add(sectors).map_or(true, |end| end > array_sectors) {
            return Err(RaidError::OutOfRange {
                sector,
                sectors,
                array_sectors,
            });
        }
        Ok(())
    }

    /// Length of the piece starting at `pos`, cut at the chunk end when needed.
    fn piece_len(&self, pos: u64, end: u64) -> u64 {
        let len = end - pos;
        if self.geo.splits_at_chunks() {
            len.min(self.geo.chunk_remainder(pos))
        } else {
            len
        }
    }

    /// Starts a logical read. `done` runs once with the data or the error.
    ///
    /// Fails without calling `done` when the range is invalid or no replica
    /// set is free.
    pub(crate) fn submit_read(
        self: &Arc<Self>,
        sector: u64,
        sectors: u64,
        done: RequestDone,
    ) -> RaidResult<()> {
        if self.is_stopped() {
            return Err(RaidError::Stopped);
        }
        self.check_range(sector, sectors)?;
        let end = sector + sectors;
        let master = MasterRequest::read(sector, sectors, done);

        let len = self.piece_len(sector, end);
        let mut next = Some(self.pool.try_alloc(
            ReplicaSet::new(SetKind::Read, sector, len).with_master(Arc::clone(&master)),
        )?);
        let mut pos = sector;
        while pos < end {
            let len = self.piece_len(pos, end);
            let h = match next.take() {
                Some(h) => h,
                None => self.pool.alloc_wait(
                    ReplicaSet::new(SetKind::Read, pos, len).with_master(Arc::clone(&master)),
                ),
            };
            master.add_piece();
            self.barrier.wait_barrier();
            pos += self.issue_read(h, ReadContext::Caller).unwrap_or(len);
        }
        master.put_piece();
        Ok(())
    }

    /// Balances and issues the read for set `h`, which already holds an
    /// admission reference. Returns the sectors covered by this set.
    pub(crate) fn issue_read(self: &Arc<Self>, h: SetHandle, ctx: ReadContext) -> Option<u64> {
        let (choice, sector, wanted, sectors, master) = self.pool.with(h, |set| {
            let wanted = set.sectors;
            let choice = self.read_balance(set);
            if let Some(c) = &choice {
                set.sectors = set.sectors.min(c.max_sectors.max(1));
            }
            (choice, set.sector, wanted, set.sectors, set.master.clone())
        })?;

        let Some(choice) = choice else {
            warn!(sector, sectors, "no readable replica");
            self.fail_foreground(h, RaidError::Unrecoverable { sector, sectors });
            return Some(sectors);
        };

        if ctx == ReadContext::Worker && sectors < wanted {
            // Queue the rest before issuing so the master cannot complete early.
            if let Some(master) = master {
                master.add_piece();
                self.barrier.nested_enter();
                let rest = ReplicaSet::new(SetKind::Read, sector + sectors, wanted - sectors)
                    .with_master(master);
                let h2 = self.pool.alloc_wait(rest);
                self.barrier.inc_queued();
                self.retry.push(RetryWork::ReadContinue(h2));
            }
        }

        debug!(
            sector,
            sectors,
            device = %choice.device.id(),
            addr = choice.addr,
            "issuing read"
        );
        let core = Arc::clone(self);
        let slot = choice.slot;
        self.transport.submit(
            IoRequest::read(choice.device.id(), choice.addr, sectors),
            Box::new(move |result| core.end_read(h, slot, result)),
        );
        Some(sectors)
    }

    /// Starts a logical write of `payload` at `sector`.
    ///
    /// Fails without calling `done` when the payload is misaligned, the range
    /// is invalid or no replica set is free.
    pub(crate) fn submit_write(
        self: &Arc<Self>,
        sector: u64,
        payload: bytes::Bytes,
        done: RequestDone,
    ) -> RaidResult<()> {
        if self.is_stopped() {
            return Err(RaidError::Stopped);
        }
        if payload.is_empty() || payload.len() % SECTOR_SIZE != 0 {
            return Err(RaidError::Misaligned { len: payload.len() });
        }
        let sectors = (payload.len() / SECTOR_SIZE) as u64;
        self.check_range(sector, sectors)?;
        let end = sector + sectors;
        let master = MasterRequest::write(sector, payload, done);

        let len = self.piece_len(sector, end);
        let mut next = Some(self.pool.try_alloc(
            ReplicaSet::new(SetKind::Write, sector, len).with_master(Arc::clone(&master)),
        )?);
        let mut pos = sector;
        while pos < end {
            let len = self.piece_len(pos, end);
            let h = match next.take() {
                Some(h) => h,
                None => self.pool.alloc_wait(
                    ReplicaSet::new(SetKind::Write, pos, len).with_master(Arc::clone(&master)),
                ),
            };
            master.add_piece();
            self.barrier.wait_barrier();
            pos += self.issue_write(h, &master).unwrap_or(len);
        }
        master.put_piece();
        Ok(())
    }

    /// Issues one write wave for set `h`. Returns the sectors it covers,
    /// which may be fewer than requested when a replica has a bad block.
    fn issue_write(self: &Arc<Self>, h: SetHandle, master: &MasterRequest) -> Option<u64> {
        let (sector, sectors) = self.pool.with(h, |set| (set.sector, set.sectors))?;
        let (slots, max, degraded) = loop {
            match self.plan_write(sector, sectors) {
                WritePlan::Ready {
                    slots,
                    max,
                    degraded,
                } => break (slots, max, degraded),
                WritePlan::Blocked { device, acquired } => {
                    self.wait_blocked(device, acquired);
                }
            }
        };

        let offset = (sector - master.sector) as usize * SECTOR_SIZE;
        let payload = master.payload.slice(offset..offset + max as usize * SECTOR_SIZE);
        let mut targets = Vec::new();
        self.pool.with(h, |set| {
            set.sectors = max;
            set.payload = payload.clone();
            if degraded {
                set.flags.insert(SetFlags::DEGRADED);
            }
            set.slots = slots;
            for (idx, slot) in set.slots.iter_mut().enumerate() {
                if let Some(dev) = &slot.primary {
                    slot.primary_io = SlotIo::Writing;
                    targets.push((idx, false, Arc::clone(dev), slot.addr));
                }
                if let Some(dev) = &slot.replacement {
                    slot.replacement_io = SlotIo::Writing;
                    targets.push((idx, true, Arc::clone(dev), slot.addr));
                }
            }
        })?;

        // One extra count keeps the set alive until every write is issued.
        self.pool.set_remaining(h, targets.len() as u32 + 1);
        self.bitmap.start_write(sector, max);
        debug!(sector, sectors = max, replicas = targets.len(), degraded, "issuing write");
        for (idx, is_replacement, dev, addr) in targets {
            let core = Arc::clone(self);
            self.transport.submit(
                IoRequest::write(dev.id(), addr, payload.clone()),
                Box::new(move |result| core.end_write(h, idx, is_replacement, result)),
            );
        }
        self.one_write_done(h);
        Some(max)
    }

    /// Collects write targets for `[sector, sector + sectors)`, taking a
    /// pending reference on each.
    fn plan_write(&self, sector: u64, sectors: u64) -> WritePlan {
        let mirrors = self.mirrors.read();
        let mut max = sectors;
        let mut degraded = false;
        let mut slots: Vec<ReplicaSlot> = Vec::with_capacity(self.geo.copies());

        for replica in self.geo.locate(sector) {
            let mirror = &mirrors[replica.devnum];
            let rdev = mirror.live_rdev().cloned();
            let rrdev = mirror.live_replacement().cloned();
            let blocked = rdev
                .iter()
                .chain(rrdev.iter())
                .find(|d| d.is_blocked())
                .cloned();
            if let Some(device) = blocked {
                return WritePlan::Blocked {
                    device,
                    acquired: slots,
                };
            }

            let mut slot = ReplicaSlot::new(replica);
            match rdev {
                None => degraded = true,
                Some(dev) => {
                    let mut skip = false;
                    if dev.write_error_seen() {
                        if let Some(bad) = self.bad_blocks.query(dev.id(), replica.addr, max) {
                            if bad.first_bad <= replica.addr {
                                // Cannot write here; the bad run is tracked instead.
                                let bad_sectors = bad.sectors - (replica.addr - bad.first_bad);
                                max = max.min(bad_sectors);
                                skip = true;
                            } else {
                                max = max.min(bad.first_bad - replica.addr);
                            }
                        }
                    }
                    if !skip {
                        dev.inc_pending();
                        slot.primary = Some(dev);
                    }
                }
            }
            if let Some(dev) = rrdev {
                dev.inc_pending();
                slot.replacement = Some(dev);
            }
            slots.push(slot);
        }
        WritePlan::Ready {
            slots,
            max,
            degraded,
        }
    }

    /// Drops everything a write holds, waits for `device` to unblock and
    /// re-enters admission.
    fn wait_blocked(&self, device: Arc<Device>, acquired: Vec<ReplicaSlot>) {
        device.inc_pending();
        for slot in &acquired {
            slot.primary.iter().for_each(|d| d.dec_pending());
            slot.replacement.iter().for_each(|d| d.dec_pending());
        }
        self.barrier.allow_barrier();
        self.stats.add_write_restarts(1);
        debug!(device = %device.id(), "write waiting for blocked device");
        let timeout = Duration::from_millis(self.config.blocked_wait_ms.max(1));
        while device.is_blocked() && !device.is_faulty() && !self.is_stopped() {
            device.wait_unblocked(timeout);
        }
        device.dec_pending();
        self.barrier.wait_barrier();
    }
}

enum WritePlan {
    Ready {
        slots: Vec<ReplicaSlot>,
        max: u64,
        degraded: bool,
    },
    Blocked {
        device: Arc<Device>,
        acquired: Vec<ReplicaSlot>,
    },
}
