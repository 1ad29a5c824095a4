//! The assembled array.
//!
//! [`Raid10`] owns the shared [`ArrayCore`] and the retry worker thread.
//! The core is shared with transport completions, the worker and any thread
//! running a sync pass; everything mutable in it sits behind atomics or
//! short `parking_lot` locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::badblocks::BadBlockOracle;
use crate::barrier::{Barrier, BarrierState};
use crate::bitmap::WriteIntentBitmap;
use crate::config::RaidConfig;
use crate::device::{Device, DeviceId, MirrorSlot, MAX_SECTOR};
use crate::error::{RaidError, RaidResult};
use crate::geometry::{Geometry, SECTOR_SIZE};
use crate::pool::SetPool;
use crate::replica::RequestDone;
use crate::resync::{SyncMode, SyncReport, SyncState};
use crate::retry::{spawn_worker, RetryQueue, RetryWork};
use crate::stats::{RaidStats, RaidStatsSnapshot};
use crate::transport::BlockTransport;

/// Slot index, device and whether it is the slot's replacement.
fn locate_device(mirrors: &[MirrorSlot], id: DeviceId) -> Option<(usize, Arc<Device>, bool)> {
    mirrors.iter().enumerate().find_map(|(i, m)| {
        if let Some(d) = m.rdev.as_ref().filter(|d| d.id() == id) {
            return Some((i, Arc::clone(d), false));
        }
        m.replacement
            .as_ref()
            .filter(|d| d.id() == id)
            .map(|d| (i, Arc::clone(d), true))
    })
}

/// State shared by dispatch, completions, the retry worker and sync passes.
pub(crate) struct ArrayCore {
    pub(crate) config: RaidConfig,
    pub(crate) geo: Geometry,
    pub(crate) mirrors: RwLock<Vec<MirrorSlot>>,
    pub(crate) barrier: Barrier,
    pub(crate) pool: SetPool,
    pub(crate) retry: RetryQueue,
    pub(crate) transport: Arc<dyn BlockTransport>,
    pub(crate) bad_blocks: Arc<dyn BadBlockOracle>,
    pub(crate) bitmap: Arc<dyn WriteIntentBitmap>,
    pub(crate) sync: SyncState,
    pub(crate) stats: RaidStats,
    stopped: AtomicBool,
}

impl ArrayCore {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether every mirror group keeps a working member, ignoring `skip`.
    pub(crate) fn covered_without(&self, mirrors: &[MirrorSlot], skip: Option<usize>) -> bool {
        self.geo.covered(|i| {
            Some(i) != skip && mirrors.get(i).is_some_and(|m| m.is_working())
        })
    }

    fn find_device(&self, id: DeviceId) -> Option<(usize, Arc<Device>, bool)> {
        locate_device(&self.mirrors.read(), id)
    }

    /// Marks a device faulty unless it holds the last copy of some data.
    /// Returns whether the device is now faulty.
    pub(crate) fn fail_device(&self, id: DeviceId) -> bool {
        let mirrors = self.mirrors.read();
        let Some((devnum, dev, replacement)) = locate_device(&mirrors, id) else {
            return false;
        };
        if dev.is_faulty() {
            return true;
        }
        if !replacement && dev.is_in_sync() && !self.covered_without(&mirrors, Some(devnum)) {
            warn!(device = %id, devnum, "refusing to fail the last working copy");
            return false;
        }
        let was_in_sync = dev.clear_in_sync();
        dev.set_faulty();
        drop(mirrors);

        self.sync.interrupt();
        self.stats.add_devices_failed(1);
        error!(device = %id, devnum, was_in_sync, replacement, "device failed, continuing degraded");
        true
    }

    /// Brings recovered devices into service. Returns how many changed.
    pub(crate) fn spare_active(&self) -> usize {
        let mut mirrors = self.mirrors.write();
        let mut count = 0;
        for (devnum, mirror) in mirrors.iter_mut().enumerate() {
            let recovered_replacement = mirror
                .live_replacement()
                .is_some_and(|r| r.recovery_offset() == MAX_SECTOR);
            if recovered_replacement {
                if let Some(old) = mirror.rdev.take() {
                    old.clear_in_sync();
                    old.set_faulty();
                }
                mirror.rdev = mirror.replacement.take();
                if let Some(new) = &mirror.rdev {
                    new.set_in_sync();
                    info!(device = %new.id(), devnum, "replacement took over slot");
                }
                count += 1;
            } else if let Some(rdev) = mirror.live_rdev() {
                if rdev.recovery_offset() == MAX_SECTOR && rdev.set_in_sync() {
                    info!(device = %rdev.id(), devnum, "device now in sync");
                    count += 1;
                }
            }
        }
        count
    }
}

/// A striped-mirror array over a block transport.
pub struct Raid10 {
    core: Arc<ArrayCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Raid10 {
    /// Assembles an array from `members`, one entry per mirror slot.
    ///
    /// `config.dev_sectors` of 0 uses the smallest member. Fails when a
    /// member is too small or some mirror group has no in-sync device.
    pub fn new(
        mut config: RaidConfig,
        transport: Arc<dyn BlockTransport>,
        bad_blocks: Arc<dyn BadBlockOracle>,
        bitmap: Arc<dyn WriteIntentBitmap>,
        members: Vec<Option<Arc<Device>>>,
    ) -> RaidResult<Self> {
        if members.len() != config.raid_disks {
            return Err(RaidError::InvalidGeometry {
                reason: format!(
                    "{} members supplied for {} slots",
                    members.len(),
                    config.raid_disks
                ),
            });
        }
        if config.dev_sectors == 0 {
            config.dev_sectors = members
                .iter()
                .flatten()
                .map(|d| d.sectors())
                .min()
                .unwrap_or(0);
        }
        let geo = config.geometry()?;
        if let Some(small) = members
            .iter()
            .flatten()
            .find(|d| d.sectors() < geo.dev_sectors())
        {
            return Err(RaidError::InvalidGeometry {
                reason: format!(
                    "{} has {} sectors, {} needed",
                    small.id(),
                    small.sectors(),
                    geo.dev_sectors()
                ),
            });
        }

        let mirrors: Vec<MirrorSlot> = members.into_iter().map(MirrorSlot::new).collect();
        let reserve = config.resync_depth as usize + config.raid_disks;
        let core = Arc::new(ArrayCore {
            geo,
            mirrors: RwLock::new(mirrors),
            barrier: Barrier::new(config.resync_depth),
            pool: SetPool::new(config.pool_size, reserve),
            retry: RetryQueue::new(),
            transport,
            bad_blocks,
            bitmap,
            sync: SyncState::new(config.start_clean),
            stats: RaidStats::new(),
            stopped: AtomicBool::new(false),
            config,
        });
        if !core.covered_without(&core.mirrors.read(), None) {
            return Err(RaidError::NotEnoughDevices {
                reason: "a mirror group has no in-sync member".to_string(),
            });
        }
        let worker = spawn_worker(Arc::clone(&core)).map_err(|e| RaidError::Config {
            reason: format!("cannot start retry worker: {}", e),
        })?;

        info!(
            raid_disks = core.geo.raid_disks(),
            layout = %core.geo.layout(),
            chunk_sectors = core.geo.chunk_sectors(),
            array_sectors = core.geo.array_sectors(),
            "array assembled"
        );
        Ok(Self {
            core,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn core(&self) -> &Arc<ArrayCore> {
        &self.core
    }

    /// Array geometry.
    pub fn geometry(&self) -> &Geometry {
        &self.core.geo
    }

    /// Configuration the array was built with.
    pub fn config(&self) -> &RaidConfig {
        &self.core.config
    }

    /// Looks up a member or replacement.
    pub fn device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.core.find_device(id).map(|(_, d, _)| d)
    }

    /// Adds a new device. It fills the first empty slot, or else becomes the
    /// replacement of a device that asked for one. Returns the slot index.
    ///
    /// The device must be rebuilt with a [`SyncMode::Recovery`] pass before
    /// it serves reads.
    pub fn add_device(&self, dev: Arc<Device>) -> RaidResult<usize> {
        self.check_new_device(&dev)?;
        let mut mirrors = self.core.mirrors.write();
        let slot = match mirrors.iter().position(|m| m.rdev.is_none()) {
            Some(slot) => {
                mirrors[slot].rdev = Some(Arc::clone(&dev));
                slot
            }
            None => {
                let slot = mirrors
                    .iter()
                    .position(|m| {
                        m.replacement.is_none()
                            && m.rdev.as_ref().is_some_and(|r| r.wants_replacement())
                    })
                    .ok_or_else(|| RaidError::SlotBusy {
                        slot: self.core.geo.raid_disks(),
                        reason: "no empty slot and no device wants replacement".to_string(),
                    })?;
                mirrors[slot].replacement = Some(Arc::clone(&dev));
                slot
            }
        };
        dev.clear_in_sync();
        dev.set_recovery_offset(0);
        drop(mirrors);
        self.core.sync.set_fullsync();
        self.core.sync.bump_epoch();
        info!(device = %dev.id(), slot, "device added for recovery");
        Ok(slot)
    }

    /// Returns a previously removed device to `slot`. Recovery of a re-added
    /// device may skip regions the bitmap records as clean.
    pub fn readd_device(&self, slot: usize, dev: Arc<Device>) -> RaidResult<()> {
        self.check_new_device(&dev)?;
        let mut mirrors = self.core.mirrors.write();
        let mirror = mirrors.get_mut(slot).ok_or_else(|| RaidError::SlotBusy {
            slot,
            reason: "no such slot".to_string(),
        })?;
        if mirror.rdev.is_some() {
            return Err(RaidError::SlotBusy {
                slot,
                reason: "slot is occupied".to_string(),
            });
        }
        dev.clear_in_sync();
        dev.set_recovery_offset(0);
        mirror.rdev = Some(Arc::clone(&dev));
        drop(mirrors);
        self.core.sync.bump_epoch();
        info!(device = %dev.id(), slot, "device re-added");
        Ok(())
    }

    fn check_new_device(&self, dev: &Device) -> RaidResult<()> {
        if dev.sectors() < self.core.geo.dev_sectors() {
            return Err(RaidError::InvalidGeometry {
                reason: format!(
                    "{} has {} sectors, {} needed",
                    dev.id(),
                    dev.sectors(),
                    self.core.geo.dev_sectors()
                ),
            });
        }
        if self.core.find_device(dev.id()).is_some() {
            return Err(RaidError::SlotBusy {
                slot: self.core.geo.raid_disks(),
                reason: format!("{} is already a member", dev.id()),
            });
        }
        Ok(())
    }

    /// Detaches a device with no I/O in flight. A working in-sync device must
    /// be failed first. Removing a primary promotes its replacement.
    pub fn remove_device(&self, id: DeviceId) -> RaidResult<()> {
        let mut mirrors = self.core.mirrors.write();
        let (slot, dev, replacement) =
            locate_device(&mirrors, id).ok_or(RaidError::DeviceNotFound(id))?;
        let mirror = &mut mirrors[slot];

        if dev.nr_pending() > 0 {
            return Err(RaidError::SlotBusy {
                slot,
                reason: format!("{} has {} I/Os in flight", id, dev.nr_pending()),
            });
        }
        if !replacement && dev.is_in_sync() && !dev.is_faulty() && mirror.replacement.is_none() {
            return Err(RaidError::SlotBusy {
                slot,
                reason: format!("{} is working; fail it first", id),
            });
        }
        if replacement {
            mirror.replacement = None;
        } else {
            mirror.rdev = mirror.replacement.take();
        }
        info!(device = %id, slot, replacement, "device removed");
        Ok(())
    }

    /// Fails a device. Refused (returns false) when it holds the last
    /// working copy of some region.
    pub fn fail_device(&self, id: DeviceId) -> bool {
        self.core.fail_device(id)
    }

    /// Asks for `id` to be replaced; the next added device rebuilds alongside it.
    pub fn request_replacement(&self, id: DeviceId) -> RaidResult<()> {
        let dev = self.device(id).ok_or(RaidError::DeviceNotFound(id))?;
        if dev.set_want_replacement() {
            info!(device = %id, "replacement requested");
        }
        Ok(())
    }

    /// Starts a read; `done` runs exactly once with the data or the error.
    /// Errors returned here mean `done` was never called.
    pub fn submit_read(&self, sector: u64, sectors: u64, done: RequestDone) -> RaidResult<()> {
        self.core.submit_read(sector, sectors, done)
    }

    /// Starts a write of `payload`, a whole number of sectors.
    pub fn submit_write(&self, sector: u64, payload: Bytes, done: RequestDone) -> RaidResult<()> {
        self.core.submit_write(sector, payload, done)
    }

    /// Reads and waits. Must not be called from inside an async runtime.
    pub fn read(&self, sector: u64, sectors: u64) -> RaidResult<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.submit_read(
            sector,
            sectors,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.blocking_recv().map_err(|_| RaidError::Stopped)?
    }

    /// Writes and waits. Must not be called from inside an async runtime.
    pub fn write(&self, sector: u64, payload: Bytes) -> RaidResult<()> {
        let (tx, rx) = oneshot::channel();
        self.submit_write(
            sector,
            payload,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.blocking_recv().map_err(|_| RaidError::Stopped)?.map(|_| ())
    }

    /// Runs a background pass on the calling thread.
    pub fn run_sync(&self, mode: SyncMode) -> RaidResult<SyncReport> {
        self.core.run_sync(mode)
    }

    /// Asks a running pass to stop at its next window.
    pub fn interrupt_sync(&self) {
        self.core.sync.interrupt();
    }

    /// Virtual sector below which replicas are known identical.
    pub fn resync_checkpoint(&self) -> u64 {
        self.core.sync.recovery_cp()
    }

    /// Brings recovered spares and replacements into service.
    pub fn spare_active(&self) -> usize {
        self.core.spare_active()
    }

    /// Whether every mirror group has a working in-sync device.
    pub fn enough(&self) -> bool {
        self.core.covered_without(&self.core.mirrors.read(), None)
    }

    /// One-line summary, e.g. `512K chunks 2 near-copies [4/4] [UUUU]`.
    pub fn status(&self) -> String {
        let geo = &self.core.geo;
        let mut parts = Vec::new();
        if geo.near_copies() < geo.raid_disks() {
            parts.push(format!("{}K chunks", geo.chunk_sectors() * SECTOR_SIZE as u64 / 1024));
        }
        if geo.near_copies() > 1 {
            parts.push(format!("{} near-copies", geo.near_copies()));
        }
        if geo.far_copies() > 1 {
            let kind = if geo.layout().far_offset { "offset" } else { "far" };
            parts.push(format!("{} {}-copies", geo.far_copies(), kind));
        }
        let mirrors = self.core.mirrors.read();
        let working = mirrors.iter().filter(|m| m.is_working()).count();
        let map: String = mirrors
            .iter()
            .map(|m| if m.is_working() { 'U' } else { '_' })
            .collect();
        parts.push(format!("[{}/{}] [{}]", geo.raid_disks(), working, map));
        parts.join(" ")
    }

    /// Holds off all I/O (`true`) or lets it resume (`false`).
    pub fn quiesce(&self, on: bool) {
        if on {
            self.core.barrier.raise_barrier(false);
        } else {
            self.core.barrier.lower_barrier();
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RaidStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Admission counters.
    pub fn barrier_state(&self) -> BarrierState {
        self.core.barrier.snapshot()
    }

    /// Deferred sets waiting for the retry worker.
    pub fn retry_depth(&self) -> usize {
        self.core.retry.depth()
    }

    /// Rejects new requests, waits for in-flight work and stops the worker.
    pub fn stop(&self) {
        if self.core.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.sync.interrupt();
        self.core.pool.wait_idle();
        self.core.retry.push(RetryWork::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("retry worker panicked");
            }
        }
        info!("array stopped");
    }
}

impl Drop for Raid10 {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Raid10 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Raid10")
            .field("geometry", &self.core.geo)
            .field("status", &self.status())
            .finish()
    }
}
