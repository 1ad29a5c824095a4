//! Background resync, check, repair and recovery.
//!
//! A pass walks the array in windows of `resync_sectors`. Each window raises
//! the barrier, reads replicas and hands the set to the retry worker, which
//! compares or copies and writes. Resync style passes walk virtual sectors;
//! recovery walks physical sectors of the devices being rebuilt.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::array::ArrayCore;
use crate::device::{Device, MAX_SECTOR};
use crate::error::{RaidError, RaidResult};
use crate::geometry::PAGE_SECTORS;
use crate::pool::SetHandle;
use crate::replica::{RecoveryPlan, ReplicaSet, ReplicaSlot, SetFlags, SetKind, SlotIo};
use crate::transport::{sync_io, IoRequest};

/// Kind of background pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Make replicas identical from the resync checkpoint on.
    Resync,
    /// Count mismatches without writing.
    Check,
    /// Count mismatches and rewrite them.
    Repair,
    /// Rebuild spares and replacements from in-sync replicas.
    Recovery,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMode::Resync => "resync",
            SyncMode::Check => "check",
            SyncMode::Repair => "repair",
            SyncMode::Recovery => "recovery",
        };
        f.write_str(name)
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Pass that ran.
    pub mode: SyncMode,
    /// Where the pass stopped (virtual sectors, or device sectors for recovery).
    pub cursor: u64,
    /// Sectors read and, where needed, written.
    pub synced_sectors: u64,
    /// Sectors skipped as clean or unsyncable.
    pub skipped_sectors: u64,
    /// Sectors whose replicas differed.
    pub mismatches: u64,
    /// Stopped early by a device failure, an abort or array shutdown.
    pub interrupted: bool,
    /// Devices brought into service when the pass ended.
    pub devices_activated: usize,
}

impl SyncReport {
    fn new(mode: SyncMode, cursor: u64) -> Self {
        Self {
            mode,
            cursor,
            synced_sectors: 0,
            skipped_sectors: 0,
            mismatches: 0,
            interrupted: false,
            devices_activated: 0,
        }
    }
}

/// Resync progress shared with the read balancer.
#[derive(Debug)]
pub(crate) struct SyncState {
    recovery_cp: AtomicU64,
    next_resync: AtomicU64,
    fullsync: AtomicBool,
    interrupted: AtomicBool,
    epoch: AtomicU64,
    running: Mutex<Option<SyncMode>>,
    mismatches: AtomicU64,
}

impl SyncState {
    pub(crate) fn new(clean: bool) -> Self {
        Self {
            recovery_cp: AtomicU64::new(if clean { MAX_SECTOR } else { 0 }),
            next_resync: AtomicU64::new(0),
            fullsync: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            epoch: AtomicU64::new(1),
            running: Mutex::new(None),
            mismatches: AtomicU64::new(0),
        }
    }

    /// Virtual sector below which replicas are known identical.
    pub(crate) fn recovery_cp(&self) -> u64 {
        self.recovery_cp.load(Ordering::Acquire)
    }

    /// Start of the window the running resync is working on.
    pub(crate) fn next_resync(&self) -> u64 {
        self.next_resync.load(Ordering::Acquire)
    }

    /// Asks the running pass to stop at the next window.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Forces the next pass to ignore the bitmap.
    pub(crate) fn set_fullsync(&self) {
        self.fullsync.store(true, Ordering::Release);
    }

    fn fullsync(&self) -> bool {
        self.fullsync.load(Ordering::Acquire)
    }

    /// Current device-configuration epoch.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Starts a new epoch so slots disabled for recovery are retried.
    pub(crate) fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Pass currently running.
    pub(crate) fn mode(&self) -> Option<SyncMode> {
        *self.running.lock()
    }
}

enum SyncStep {
    Issued(u64),
    Skipped(u64),
}

/// A recovery window for one mirror slot, before I/O is issued.
struct RecoverySetup {
    vsect: u64,
    slots: Vec<ReplicaSlot>,
    plan: RecoveryPlan,
    source: Arc<Device>,
}

impl ArrayCore {
    /// Runs one pass to completion or interruption.
    pub(crate) fn run_sync(self: &Arc<Self>, mode: SyncMode) -> RaidResult<SyncReport> {
        if self.is_stopped() {
            return Err(RaidError::Stopped);
        }
        {
            let mut running = self.sync.running.lock();
            if let Some(current) = *running {
                return Err(RaidError::SyncInProgress {
                    mode: current.to_string(),
                });
            }
            *running = Some(mode);
        }
        self.sync.interrupted.store(false, Ordering::Release);
        self.sync.mismatches.store(0, Ordering::Release);
        info!(%mode, "sync pass starting");

        let mut report = match mode {
            SyncMode::Recovery => self.recovery_pass(),
            _ => self.resync_pass(mode),
        };
        report.devices_activated = self.spare_active();
        *self.sync.running.lock() = None;

        info!(
            %mode,
            cursor = report.cursor,
            synced = report.synced_sectors,
            skipped = report.skipped_sectors,
            mismatches = report.mismatches,
            interrupted = report.interrupted,
            activated = report.devices_activated,
            "sync pass finished"
        );
        Ok(report)
    }

    fn resync_pass(self: &Arc<Self>, mode: SyncMode) -> SyncReport {
        let end = self.geo.array_sectors();
        let mut s = 0;
        if mode == SyncMode::Resync {
            let cp = self.sync.recovery_cp();
            if cp == MAX_SECTOR {
                self.sync.recovery_cp.store(0, Ordering::Release);
            } else {
                s = cp;
            }
        }
        let use_bitmap = mode == SyncMode::Resync && self.bitmap.is_present() && !self.sync.fullsync();
        let mut report = SyncReport::new(mode, s);
        let mut last_checkpoint = s;

        while s < end {
            if self.sync.interrupted() || self.is_stopped() {
                report.interrupted = true;
                break;
            }
            let mut max = self
                .config
                .resync_sectors
                .min(end - s)
                .min(self.geo.chunk_remainder(s));
            if use_bitmap {
                let (needed, len) = self.bitmap.start_sync(s);
                let len = len.max(1).min(end - s);
                if !needed {
                    report.skipped_sectors += len;
                    s += len;
                    continue;
                }
                max = max.min(len);
            }
            self.sync.next_resync.store(s, Ordering::Release);
            match self.sync_chunk(s, max) {
                SyncStep::Issued(n) => {
                    report.synced_sectors += n;
                    s += n;
                }
                SyncStep::Skipped(n) => {
                    report.skipped_sectors += n;
                    s += n;
                }
            }
            if mode == SyncMode::Resync && s - last_checkpoint >= self.config.checkpoint_sectors {
                self.barrier.close_sync();
                self.sync.recovery_cp.store(s, Ordering::Release);
                last_checkpoint = s;
                debug!(checkpoint = s, "resync checkpoint");
            }
        }
        self.barrier.close_sync();
        self.bitmap.close_sync();
        report.cursor = s.min(end);

        if report.interrupted {
            if mode == SyncMode::Resync {
                self.sync.recovery_cp.store(s, Ordering::Release);
            }
        } else if mode != SyncMode::Check {
            self.sync.recovery_cp.store(MAX_SECTOR, Ordering::Release);
            if !self.bitmap.is_present() || self.sync.fullsync() {
                // Every sector was written to the replacements as well.
                for mirror in self.mirrors.read().iter() {
                    if let Some(r) = mirror.live_replacement() {
                        r.set_recovery_offset(MAX_SECTOR);
                    }
                }
            }
            self.sync.fullsync.store(false, Ordering::Release);
        }
        report.mismatches = self.sync.mismatches.load(Ordering::Acquire);
        report
    }

    /// Reads every in-sync replica of one window. Returns how far it got.
    fn sync_chunk(self: &Arc<Self>, sector: u64, max: u64) -> SyncStep {
        let mut set = ReplicaSet::new(SetKind::Sync, sector, max);
        set.flags.insert(SetFlags::IS_SYNC);
        let h = self.pool.alloc_wait(set);
        self.barrier.raise_barrier(false);

        let mut sectors = max;
        let mut slots = Vec::with_capacity(self.geo.copies());
        let mut count = 0;
        {
            let mirrors = self.mirrors.read();
            for replica in self.geo.locate(sector) {
                let mut slot = ReplicaSlot::new(replica);
                let mirror = &mirrors[replica.devnum];
                if let Some(rdev) = mirror.live_rdev().filter(|d| d.is_in_sync()) {
                    let usable = match self.bad_blocks.query(rdev.id(), replica.addr, sectors) {
                        Some(bad) if bad.first_bad <= replica.addr => {
                            // The bad run decides how far this window may go.
                            let bad_sectors = bad.sectors - (replica.addr - bad.first_bad);
                            sectors = sectors.min(bad_sectors);
                            false
                        }
                        Some(bad) => {
                            sectors = sectors.min(bad.first_bad - replica.addr);
                            true
                        }
                        None => true,
                    };
                    if usable {
                        rdev.inc_pending();
                        slot.primary = Some(Arc::clone(rdev));
                        slot.primary_io = SlotIo::Reading;
                        count += 1;
                    }
                }
                if let Some(rrdev) = mirror.live_replacement() {
                    rrdev.inc_pending();
                    slot.replacement = Some(Arc::clone(rrdev));
                }
                slots.push(slot);
            }
        }

        if count < 2 {
            for slot in &slots {
                slot.primary.iter().for_each(|d| d.dec_pending());
                slot.replacement.iter().for_each(|d| d.dec_pending());
            }
            self.pool.release(h);
            self.bitmap.abort_sync(sector, sectors);
            self.barrier.lower_barrier();
            debug!(sector, sectors, readable = count, "too few replicas to sync");
            return SyncStep::Skipped(sectors);
        }

        let reads: Vec<_> = slots
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.primary.as_ref().map(|d| (idx, d.id(), s.addr)))
            .collect();
        self.pool.with(h, |set| {
            set.sectors = sectors;
            set.slots = slots;
        });
        self.pool.set_remaining(h, count);
        for (idx, device, addr) in reads {
            let core = Arc::clone(self);
            self.transport.submit(
                IoRequest::read(device, addr, sectors),
                Box::new(move |result| core.end_sync_read(h, idx, result)),
            );
        }
        SyncStep::Issued(sectors)
    }

    /// Compares the replicas of a resync window and writes the ones that
    /// differ or failed to read.
    pub(crate) fn sync_request_write(self: &Arc<Self>, h: SetHandle) {
        let check = self.sync.mode() == Some(SyncMode::Check);
        let Some((targets, mismatched, sector, sectors)) = self.pool.with(h, |set| {
            let sectors = set.sectors;
            let Some(first) = set.slots.iter().position(|s| s.primary_io == SlotIo::ReadOk) else {
                return (Vec::new(), 0, set.sector, sectors);
            };
            set.read_slot = Some(first);
            let good = set.slots[first].data.clone();
            let mut mismatched = 0;
            let mut targets = Vec::new();
            for (idx, slot) in set.slots.iter_mut().enumerate() {
                if let Some(dev) = &slot.primary {
                    let write = match slot.primary_io {
                        SlotIo::ReadOk if idx == first || slot.data == good => false,
                        SlotIo::ReadOk => {
                            mismatched += sectors;
                            !check
                        }
                        SlotIo::ReadFailed => true,
                        _ => false,
                    };
                    if write {
                        dev.inc_pending();
                        slot.primary_io = SlotIo::Writing;
                        targets.push((idx, false, dev.id(), slot.addr, good.clone()));
                    }
                }
                if let Some(dev) = &slot.replacement {
                    if check {
                        dev.dec_pending();
                    } else {
                        slot.replacement_io = SlotIo::Writing;
                        targets.push((idx, true, dev.id(), slot.addr, good.clone()));
                    }
                }
            }
            (targets, mismatched, set.sector, sectors)
        }) else {
            return;
        };

        if mismatched > 0 {
            self.stats.add_resync_mismatches(mismatched);
            self.sync.mismatches.fetch_add(mismatched, Ordering::AcqRel);
            warn!(sector, sectors, mismatched, check, "replicas differ");
        }

        let no_good_copy = self
            .pool
            .with(h, |set| set.read_slot.is_none())
            .unwrap_or(true);
        if no_good_copy {
            error!(sector, sectors, "no replica readable during sync");
            self.bitmap.abort_sync(sector, sectors);
            self.pool.with(h, |set| {
                for slot in &set.slots {
                    slot.replacement.iter().for_each(|d| d.dec_pending());
                }
            });
            self.sync_set_done(h);
            return;
        }

        self.pool.set_remaining(h, targets.len() as u32 + 1);
        for (idx, replacement, device, addr, data) in targets {
            let core = Arc::clone(self);
            self.transport.submit(
                IoRequest::write(device, addr, data),
                Box::new(move |result| core.end_sync_write(h, idx, replacement, result)),
            );
        }
        self.end_sync_request(h);
    }

    /// Ends a background set: releases it and drops its barrier.
    pub(crate) fn sync_set_done(&self, h: SetHandle) {
        let Some(set) = self.pool.release(h) else {
            return;
        };
        self.stats.add_sync_sectors(set.sectors);
        if self.sync.mode() != Some(SyncMode::Check) {
            if set.flags.contains(SetFlags::WRITE_ERROR) {
                self.bitmap.abort_sync(set.sector, set.sectors);
            }
            self.bitmap.end_sync(set.sector, set.sectors);
        }
        self.barrier.lower_barrier();
    }

    fn recovery_targets(&self) -> Vec<Arc<Device>> {
        let epoch = self.sync.epoch();
        let mirrors = self.mirrors.read();
        let mut targets = Vec::new();
        for mirror in mirrors.iter() {
            if mirror.recovery_disabled.load(Ordering::Acquire) == epoch {
                continue;
            }
            if let Some(rdev) = mirror.live_rdev() {
                if !rdev.is_in_sync() && rdev.recovery_offset() < MAX_SECTOR {
                    targets.push(Arc::clone(rdev));
                }
            }
            if let Some(r) = mirror.live_replacement() {
                if r.recovery_offset() < MAX_SECTOR {
                    targets.push(Arc::clone(r));
                }
            }
        }
        targets
    }

    fn recovery_pass(self: &Arc<Self>) -> SyncReport {
        let targets = self.recovery_targets();
        let dev_end = self.geo.dev_sectors();
        let start = targets
            .iter()
            .map(|d| d.recovery_offset())
            .min()
            .unwrap_or(dev_end)
            .min(dev_end);
        let mut report = SyncReport::new(SyncMode::Recovery, start);
        if targets.is_empty() {
            return report;
        }
        info!(
            targets = ?targets.iter().map(|d| d.id()).collect::<Vec<_>>(),
            start,
            "recovering devices"
        );
        let use_bitmap = self.bitmap.is_present() && !self.sync.fullsync();
        let epoch = self.sync.epoch();
        let mut cursor = start;
        let mut last_checkpoint = start;

        while cursor < dev_end {
            if self.sync.interrupted() || self.is_stopped() {
                report.interrupted = true;
                break;
            }
            let mut step = self
                .config
                .resync_sectors
                .min(self.geo.chunk_remainder(cursor))
                .min(dev_end - cursor);

            let mut setups = Vec::new();
            let mut any = false;
            for devnum in 0..self.geo.raid_disks() {
                let Some(vsect) = self.geo.invert(cursor, devnum) else {
                    continue;
                };
                let Some(has_replacement) = self.slot_needs_recovery(devnum, cursor, epoch) else {
                    continue;
                };
                any = true;
                if use_bitmap {
                    let (needed, len) = self.bitmap.start_sync(vsect);
                    step = step.min(len.max(1));
                    if !needed && !has_replacement {
                        continue;
                    }
                }
                match self.plan_recovery(devnum, cursor, vsect, &mut step, epoch) {
                    Some(setup) => setups.push(setup),
                    None if use_bitmap => self.bitmap.abort_sync(vsect, step),
                    None => {}
                }
            }

            if setups.is_empty() {
                report.skipped_sectors += step;
            } else {
                report.synced_sectors += step;
            }
            for (i, setup) in setups.into_iter().enumerate() {
                self.issue_recovery(setup, step, i > 0);
            }
            cursor += step;

            if !any && self.recovery_targets().is_empty() {
                break;
            }
            if cursor - last_checkpoint >= self.config.checkpoint_sectors {
                self.barrier.close_sync();
                for dev in &targets {
                    if !dev.is_faulty()
                        && !self.recovery_disabled_for(dev, epoch)
                        && dev.recovery_offset() < cursor
                    {
                        dev.set_recovery_offset(cursor);
                    }
                }
                last_checkpoint = cursor;
                debug!(checkpoint = cursor, "recovery checkpoint");
            }
        }
        self.barrier.close_sync();
        self.bitmap.close_sync();
        report.cursor = cursor.min(dev_end);

        let finished = !report.interrupted;
        for dev in &targets {
            if dev.is_faulty() || self.recovery_disabled_for(dev, epoch) {
                continue;
            }
            if finished {
                dev.set_recovery_offset(MAX_SECTOR);
            } else if dev.recovery_offset() < cursor {
                dev.set_recovery_offset(cursor);
            }
        }
        if finished {
            self.sync.fullsync.store(false, Ordering::Release);
        }
        report
    }

    fn recovery_disabled_for(&self, dev: &Device, epoch: u64) -> bool {
        self.mirrors.read().iter().any(|m| {
            m.holds(dev.id()) && m.recovery_disabled.load(Ordering::Acquire) == epoch
        })
    }

    /// Whether slot `devnum` has a device to rebuild at `cursor`. The inner
    /// flag tells whether a replacement is among them.
    fn slot_needs_recovery(&self, devnum: usize, cursor: u64, epoch: u64) -> Option<bool> {
        let mirrors = self.mirrors.read();
        let mirror = mirrors.get(devnum)?;
        if mirror.recovery_disabled.load(Ordering::Acquire) == epoch {
            return None;
        }
        let rdev = mirror
            .live_rdev()
            .is_some_and(|d| !d.is_in_sync() && d.recovery_offset() <= cursor);
        let replacement = mirror
            .live_replacement()
            .is_some_and(|d| d.recovery_offset() <= cursor);
        (rdev || replacement).then_some(replacement)
    }

    /// Picks the source replica for rebuilding slot `devnum` at `cursor`,
    /// shrinking `step` to stay clear of bad blocks on the source.
    fn plan_recovery(
        &self,
        devnum: usize,
        cursor: u64,
        vsect: u64,
        step: &mut u64,
        epoch: u64,
    ) -> Option<RecoverySetup> {
        let mirrors = self.mirrors.read();
        let mirror = &mirrors[devnum];
        let mrdev = mirror
            .live_rdev()
            .filter(|d| !d.is_in_sync() && d.recovery_offset() <= cursor)
            .cloned();
        let mreplace = mirror
            .live_replacement()
            .filter(|d| d.recovery_offset() <= cursor)
            .cloned();

        let replicas = self.geo.locate(vsect);
        let target = replicas.iter().position(|r| r.devnum == devnum)?;
        let mut any_working = false;
        let mut source = None;
        for (j, replica) in replicas.iter().enumerate() {
            let Some(rdev) = mirrors[replica.devnum]
                .live_rdev()
                .filter(|d| d.is_in_sync())
            else {
                continue;
            };
            any_working = true;
            match self.bad_blocks.query(rdev.id(), replica.addr, *step) {
                Some(bad) if bad.first_bad <= replica.addr => {
                    let bad_sectors = bad.sectors - (replica.addr - bad.first_bad);
                    *step = (*step).min(bad_sectors);
                    continue;
                }
                Some(bad) => *step = (*step).min(bad.first_bad - replica.addr),
                None => {}
            }
            source = Some((j, Arc::clone(rdev)));
            break;
        }

        let Some((source_slot, source_dev)) = source else {
            // Every copy is missing or bad here.
            let addr = replicas[target].addr;
            let mut recorded = any_working;
            if any_working {
                for dev in mrdev.iter().chain(mreplace.iter()) {
                    if self.bad_blocks.set_bad(dev.id(), addr, *step) {
                        self.stats.add_bad_blocks_recorded(1);
                    } else {
                        recorded = false;
                    }
                }
            }
            if !recorded {
                warn!(devnum, cursor, "insufficient working devices, recovery of slot disabled");
                mirror.recovery_disabled.store(epoch, Ordering::Release);
            }
            return None;
        };

        let mut slots: Vec<ReplicaSlot> = replicas.into_iter().map(ReplicaSlot::new).collect();
        if let Some(dev) = mrdev {
            dev.inc_pending();
            slots[target].primary = Some(dev);
        }
        if let Some(dev) = mreplace {
            dev.inc_pending();
            slots[target].replacement = Some(dev);
        }
        source_dev.inc_pending();
        Some(RecoverySetup {
            vsect,
            slots,
            plan: RecoveryPlan {
                source: source_slot,
                target,
            },
            source: source_dev,
        })
    }

    fn issue_recovery(self: &Arc<Self>, setup: RecoverySetup, step: u64, force: bool) {
        let RecoverySetup {
            vsect,
            slots,
            plan,
            source,
        } = setup;
        let writes = plan.writes(&slots);
        let addr = slots[plan.source].addr;
        let mut set = ReplicaSet::new(SetKind::Sync, vsect, step);
        set.flags.insert(SetFlags::IS_RECOVER);
        set.slots = slots;
        set.read_slot = Some(plan.source);
        set.read_dev = Some(Arc::clone(&source));
        set.recovery = Some(plan);
        let h = self.pool.alloc_wait(set);
        self.barrier.raise_barrier(force);
        self.pool.set_remaining(h, writes);

        debug!(vsect, step, source = %source.id(), addr, "recovery read");
        let core = Arc::clone(self);
        let slot = plan.source;
        self.transport.submit(
            IoRequest::read(source.id(), addr, step),
            Box::new(move |result| core.end_sync_read(h, slot, result)),
        );
    }

    /// Writes the recovered data to the rebuilt devices of slot `target`.
    pub(crate) fn recovery_request_write(self: &Arc<Self>, h: SetHandle) {
        let Some((uptodate, plan)) = self
            .pool
            .with(h, |set| (set.flags.contains(SetFlags::UPTODATE), set.recovery))
        else {
            return;
        };
        let Some(plan) = plan else {
            self.sync_set_done(h);
            return;
        };

        if !uptodate {
            self.fix_recovery_read_error(h, plan);
            let devices = self
                .pool
                .with(h, |set| {
                    let s = &set.slots[plan.target];
                    [s.primary.clone(), s.replacement.clone()]
                })
                .unwrap_or_default();
            for dev in devices.into_iter().flatten() {
                dev.dec_pending();
                self.end_sync_request(h);
            }
            return;
        }

        let Some((data, writes)) = self.pool.with(h, |set| {
            let data = set.slots[plan.source].data.clone();
            let slot = &mut set.slots[plan.target];
            let mut writes = Vec::new();
            if let Some(dev) = &slot.primary {
                slot.primary_io = SlotIo::Writing;
                writes.push((false, dev.id(), slot.addr));
            }
            if let Some(dev) = &slot.replacement {
                slot.replacement_io = SlotIo::Writing;
                writes.push((true, dev.id(), slot.addr));
            }
            (data, writes)
        }) else {
            return;
        };
        for (replacement, device, addr) in writes {
            let core = Arc::clone(self);
            let target = plan.target;
            self.transport.submit(
                IoRequest::write(device, addr, data.clone()),
                Box::new(move |result| core.end_sync_write(h, target, replacement, result)),
            );
        }
    }

    /// Copies a window page by page after the bulk source read failed,
    /// recording bad blocks where a page cannot be read.
    fn fix_recovery_read_error(&self, h: SetHandle, plan: RecoveryPlan) {
        let Some((source, source_addr, targets, target_addr, sectors)) = self.pool.with(h, |set| {
            let t = &set.slots[plan.target];
            (
                set.read_dev.clone(),
                set.slots[plan.source].addr,
                [t.primary.clone(), t.replacement.clone()],
                t.addr,
                set.sectors,
            )
        }) else {
            return;
        };
        let Some(source) = source else {
            return;
        };
        let targets: Vec<Arc<Device>> = targets.into_iter().flatten().collect();

        let mut sect = 0;
        while sect < sectors {
            let s = (sectors - sect).min(PAGE_SECTORS);
            let read = sync_io(
                self.transport.as_ref(),
                IoRequest::read(source.id(), source_addr + sect, s),
            );
            match read {
                Ok(data) => {
                    for dev in &targets {
                        self.write_recovered_page(dev, target_addr + sect, s, &data);
                    }
                }
                Err(err) => {
                    warn!(device = %source.id(), sector = source_addr + sect, s, error = %err, "recovery source unreadable");
                    // Already unreadable; failing to record it loses nothing.
                    if self.bad_blocks.set_bad(source.id(), source_addr + sect, s) {
                        self.stats.add_bad_blocks_recorded(1);
                    }
                    let mut abort = false;
                    for dev in &targets {
                        if self.bad_blocks.set_bad(dev.id(), target_addr + sect, s) {
                            self.stats.add_bad_blocks_recorded(1);
                        } else {
                            abort = true;
                        }
                    }
                    if abort {
                        warn!(device = %source.id(), "cannot record bad block on rebuilt device, aborting recovery");
                        let epoch = self.sync.epoch();
                        if let Some(m) = self.mirrors.read().iter().find(|m| {
                            targets.iter().any(|d| m.holds(d.id()))
                        }) {
                            m.recovery_disabled.store(epoch, Ordering::Release);
                        }
                        break;
                    }
                }
            }
            sect += s;
        }
    }

    fn write_recovered_page(&self, dev: &Device, sector: u64, sectors: u64, data: &Bytes) {
        let result = sync_io(
            self.transport.as_ref(),
            IoRequest::write(dev.id(), sector, data.clone()),
        );
        if let Err(err) = result {
            warn!(device = %dev.id(), sector, sectors, error = %err, "recovery write failed");
            dev.set_write_error_seen();
            dev.set_want_replacement();
            if self.bad_blocks.set_bad(dev.id(), sector, sectors) {
                self.stats.add_bad_blocks_recorded(1);
            } else {
                self.fail_device(dev.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::tests::{mem_array, mem_array_using, mem_array_with, DEV_SECTORS};
    use crate::array::Raid10;
    use crate::badblocks::{BadBlockOracle, MemBadBlocks};
    use crate::device::DeviceId;
    use crate::geometry::SECTOR_SIZE;
    use crate::transport::{FaultRule, IoDirection, MemTransport};

    #[test]
    fn test_mode_display() {
        assert_eq!(SyncMode::Repair.to_string(), "repair");
        assert_eq!(
            serde_json::to_string(&SyncMode::Recovery).unwrap(),
            "\"recovery\""
        );
    }

    #[test]
    fn test_clean_resync_finds_no_mismatches() {
        let (array, _t, _bb) = mem_array(4);
        array
            .write(0, Bytes::from(vec![4u8; 64 * SECTOR_SIZE]))
            .unwrap();
        let report = array.run_sync(SyncMode::Resync).unwrap();
        assert!(!report.interrupted);
        assert_eq!(report.mismatches, 0);
        assert_eq!(report.synced_sectors, array.geometry().array_sectors());
        assert_eq!(array.core().sync.recovery_cp(), MAX_SECTOR);
        assert_eq!(array.barrier_state().barrier, 0);
    }

    #[test]
    fn test_bad_run_shrinks_sync_window_unconfirmed() {
        let (array, _t, bb) = mem_array(4);
        bb.set_bad(DeviceId(1), 50, 10);
        let report = array.run_sync(SyncMode::Resync).unwrap();
        // Needs clarification: md's equivalent branch assigns the window
        // length to itself, which looks like a no-op. Shrinking to the bad
        // run is the assumed intent until that is confirmed.
        // [0,50) syncs, [50,60) has one readable copy and is skipped whole,
        // then windows resume at 60 rather than at the next 128-sector step.
        assert_eq!(report.skipped_sectors, 10);
        assert_eq!(
            report.synced_sectors,
            array.geometry().array_sectors() - 10
        );
        assert_eq!(report.mismatches, 0);
    }

    #[test]
    fn test_check_counts_then_repair_fixes() {
        let (array, transport, _bb) = mem_array(4);
        array
            .write(0, Bytes::from(vec![1u8; 8 * SECTOR_SIZE]))
            .unwrap();
        assert!(transport.poke(DeviceId(1), 0, &[9u8; 8 * SECTOR_SIZE]));

        let check = array.run_sync(SyncMode::Check).unwrap();
        assert!(check.mismatches > 0);
        assert_eq!(
            transport.peek(DeviceId(1), 0, 8).unwrap(),
            vec![9u8; 8 * SECTOR_SIZE]
        );

        let repair = array.run_sync(SyncMode::Repair).unwrap();
        assert!(repair.mismatches > 0);
        assert_eq!(
            transport.peek(DeviceId(1), 0, 8).unwrap(),
            transport.peek(DeviceId(0), 0, 8).unwrap()
        );
        let again = array.run_sync(SyncMode::Check).unwrap();
        assert_eq!(again.mismatches, 0);
    }

    #[test]
    fn test_recovery_rebuilds_spare() {
        let (array, transport, _bb) = mem_array_with(4, |id| {
            if id == 2 {
                Device::spare(DeviceId(id), 8192)
            } else {
                Device::new(DeviceId(id), 8192)
            }
        });
        // Chunk 1 lives on devices 2 and 3; seed the in-sync copy directly.
        assert!(transport.poke(DeviceId(3), 0, &[6u8; 16 * SECTOR_SIZE]));
        let report = array.run_sync(SyncMode::Recovery).unwrap();
        assert!(!report.interrupted);
        assert_eq!(report.devices_activated, 1);
        let dev2 = array.device(DeviceId(2)).unwrap();
        assert!(dev2.is_in_sync());
        assert_eq!(
            transport.peek(DeviceId(2), 0, 16).unwrap(),
            vec![6u8; 16 * SECTOR_SIZE]
        );
    }

    #[test]
    fn test_recovery_without_source_records_bad_blocks() {
        let (array, _t, bb) = mem_array_with(4, |id| {
            if id == 2 {
                Device::spare(DeviceId(id), 8192)
            } else {
                Device::new(DeviceId(id), 8192)
            }
        });
        bb.set_bad(DeviceId(3), 0, 8);
        let report = array.run_sync(SyncMode::Recovery).unwrap();
        assert!(!report.interrupted);
        assert!(bb.query(DeviceId(2), 0, 8).is_some());
        assert!(array.device(DeviceId(2)).unwrap().is_in_sync());
    }

    #[test]
    fn test_recovery_read_error_is_fixed_page_by_page() {
        let (array, transport, bb) = mem_array_with(4, |id| {
            if id == 2 {
                Device::spare(DeviceId(id), 8192)
            } else {
                Device::new(DeviceId(id), 8192)
            }
        });
        assert!(transport.poke(DeviceId(3), 0, &[8u8; 16 * SECTOR_SIZE]));
        transport.inject(FaultRule::read(DeviceId(3), 8, 8));
        let report = array.run_sync(SyncMode::Recovery).unwrap();
        assert!(!report.interrupted);
        assert_eq!(
            transport.peek(DeviceId(2), 0, 8).unwrap(),
            vec![8u8; 8 * SECTOR_SIZE]
        );
        assert_eq!(
            transport.peek(DeviceId(2), 8, 8).unwrap(),
            vec![0u8; 8 * SECTOR_SIZE]
        );
        assert!(bb.query(DeviceId(3), 8, 8).is_some());
        assert!(bb.query(DeviceId(2), 8, 8).is_some());
    }

    /// Six disks, spares in slots 2 and 4. Device 2 already holds the one
    /// bad range its table allows, so nothing more can be recorded on it.
    fn two_spare_array() -> (Raid10, Arc<MemTransport>, Arc<MemBadBlocks>) {
        let (array, transport, bb) = mem_array_using(
            6,
            |id| {
                if id == 2 || id == 4 {
                    Device::spare(DeviceId(id), DEV_SECTORS)
                } else {
                    Device::new(DeviceId(id), DEV_SECTORS)
                }
            },
            MemBadBlocks::new().with_capacity(1),
        );
        assert!(bb.set_bad(DeviceId(2), 8000, 8));
        // Chunk 2 lives on slots 4 and 5.
        assert!(transport.poke(DeviceId(5), 0, &[5u8; 16 * SECTOR_SIZE]));
        (array, transport, bb)
    }

    fn assert_slot2_disabled_slot4_rebuilt(
        array: &Raid10,
        transport: &MemTransport,
        report: &SyncReport,
    ) {
        assert!(!report.interrupted);
        assert_eq!(report.devices_activated, 1);
        let core = array.core();
        assert_eq!(
            core.mirrors.read()[2].recovery_disabled.load(Ordering::Acquire),
            core.sync.epoch()
        );
        assert!(!array.device(DeviceId(2)).unwrap().is_in_sync());
        let dev4 = array.device(DeviceId(4)).unwrap();
        assert!(dev4.is_in_sync());
        assert_eq!(dev4.recovery_offset(), MAX_SECTOR);
        assert_eq!(
            transport.peek(DeviceId(4), 0, 16).unwrap(),
            vec![5u8; 16 * SECTOR_SIZE]
        );
        assert_eq!(array.status(), "512K chunks 2 near-copies [6/5] [UU_UUU]");
    }

    #[test]
    fn test_unrecordable_gap_disables_only_its_slot() {
        let (array, transport, bb) = two_spare_array();
        // Slot 2's only source is bad here and the gap cannot be recorded.
        assert!(bb.set_bad(DeviceId(3), 0, 8));
        let report = array.run_sync(SyncMode::Recovery).unwrap();
        assert_slot2_disabled_slot4_rebuilt(&array, &transport, &report);
        assert!(bb.query(DeviceId(2), 0, 8).is_none());
    }

    #[test]
    fn test_recovery_read_error_unrecordable_disables_only_its_slot() {
        let (array, transport, bb) = two_spare_array();
        transport.inject(FaultRule::read(DeviceId(3), 0, 8));
        let report = array.run_sync(SyncMode::Recovery).unwrap();
        assert_slot2_disabled_slot4_rebuilt(&array, &transport, &report);
        assert!(bb.query(DeviceId(3), 0, 8).is_some());
        assert!(bb.query(DeviceId(2), 0, 8).is_none());

        // A new configuration epoch lets the slot try again.
        array.core().sync.bump_epoch();
        transport.clear_faults();
        assert_eq!(array.core().recovery_targets().len(), 1);
    }

    #[test]
    fn test_check_leaves_replacement_untouched() {
        let (array, transport, _bb) = mem_array(4);
        array
            .write(0, Bytes::from(vec![3u8; 8 * SECTOR_SIZE]))
            .unwrap();
        transport.add_disk(DeviceId(7), DEV_SECTORS);
        array.request_replacement(DeviceId(1)).unwrap();
        assert_eq!(array.add_device(Device::new(DeviceId(7), DEV_SECTORS)).unwrap(), 1);
        transport.clear_log();

        let report = array.run_sync(SyncMode::Check).unwrap();
        assert_eq!(report.mismatches, 0);
        assert!(transport
            .log()
            .iter()
            .all(|r| r.direction == IoDirection::Read));
        assert_eq!(array.device(DeviceId(7)).unwrap().nr_pending(), 0);
        assert_eq!(
            transport.peek(DeviceId(7), 0, 8).unwrap(),
            vec![0u8; 8 * SECTOR_SIZE]
        );
    }

    #[test]
    fn test_second_pass_is_rejected() {
        let (array, _t, _bb) = mem_array(4);
        *array.core().sync.running.lock() = Some(SyncMode::Check);
        assert!(matches!(
            array.run_sync(SyncMode::Resync),
            Err(RaidError::SyncInProgress { .. })
        ));
        *array.core().sync.running.lock() = None;
    }
}
