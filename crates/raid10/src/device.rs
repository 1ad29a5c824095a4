//! Member devices and mirror slots.
//!
//! A [`Device`] is owned by whoever assembled the array; the engine only holds
//! `Arc` references and flips its state flags. Each [`MirrorSlot`] carries the
//! primary device, an optional replacement being rebuilt alongside it, and the
//! per-slot hints used by the read balancer and the recovery engine.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Sentinel watermark meaning "fully recovered".
pub const MAX_SECTOR: u64 = u64::MAX;

/// Identity of a member device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// A member device as seen by the array.
pub struct Device {
    id: DeviceId,
    sectors: u64,
    nonrotational: bool,
    in_sync: AtomicBool,
    faulty: AtomicBool,
    write_error_seen: AtomicBool,
    want_replacement: AtomicBool,
    recovery_offset: AtomicU64,
    nr_pending: AtomicU32,
    read_errors: AtomicU32,
    last_read_error: Mutex<Option<Instant>>,
    corrected_errors: AtomicU64,
    blocked: Mutex<bool>,
    unblocked: Condvar,
}

impl Device {
    /// Creates an in-sync device of `sectors` usable sectors.
    pub fn new(id: DeviceId, sectors: u64) -> Arc<Self> {
        Arc::new(Self::build(id, sectors, true))
    }

    /// Creates a spare that must be recovered before it serves reads.
    pub fn spare(id: DeviceId, sectors: u64) -> Arc<Self> {
        Arc::new(Self::build(id, sectors, false))
    }

    /// Creates an in-sync solid-state device (balanced by queue depth).
    pub fn new_nonrotational(id: DeviceId, sectors: u64) -> Arc<Self> {
        let mut dev = Self::build(id, sectors, true);
        dev.nonrotational = true;
        Arc::new(dev)
    }

    fn build(id: DeviceId, sectors: u64, in_sync: bool) -> Self {
        Self {
            id,
            sectors,
            nonrotational: false,
            in_sync: AtomicBool::new(in_sync),
            faulty: AtomicBool::new(false),
            write_error_seen: AtomicBool::new(false),
            want_replacement: AtomicBool::new(false),
            recovery_offset: AtomicU64::new(if in_sync { MAX_SECTOR } else { 0 }),
            nr_pending: AtomicU32::new(0),
            read_errors: AtomicU32::new(0),
            last_read_error: Mutex::new(None),
            corrected_errors: AtomicU64::new(0),
            blocked: Mutex::new(false),
            unblocked: Condvar::new(),
        }
    }

    /// Device identity.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Usable size in sectors.
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    /// Whether seeks are free on this device.
    pub fn is_nonrotational(&self) -> bool {
        self.nonrotational
    }

    /// Holds fully up-to-date data.
    pub fn is_in_sync(&self) -> bool {
        self.in_sync.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_sync(&self) -> bool {
        !self.in_sync.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_in_sync(&self) -> bool {
        self.in_sync.swap(false, Ordering::AcqRel)
    }

    /// Excluded from all dispatch.
    pub fn is_faulty(&self) -> bool {
        self.faulty.load(Ordering::Acquire)
    }

    pub(crate) fn set_faulty(&self) {
        self.faulty.store(true, Ordering::Release);
    }

    /// A write to this device has failed at some point.
    pub fn write_error_seen(&self) -> bool {
        self.write_error_seen.load(Ordering::Acquire)
    }

    /// Marks the device as having failed a write. Writes to it are then
    /// checked against its bad-block list.
    pub fn set_write_error_seen(&self) {
        self.write_error_seen.store(true, Ordering::Release);
    }

    /// Whether the array would like this device replaced.
    pub fn wants_replacement(&self) -> bool {
        self.want_replacement.load(Ordering::Acquire)
    }

    pub(crate) fn set_want_replacement(&self) -> bool {
        !self.want_replacement.swap(true, Ordering::AcqRel)
    }

    /// Sectors below this watermark are known good during recovery.
    pub fn recovery_offset(&self) -> u64 {
        self.recovery_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_recovery_offset(&self, sector: u64) {
        self.recovery_offset.store(sector, Ordering::Release);
    }

    /// Number of I/Os currently referencing this device.
    pub fn nr_pending(&self) -> u32 {
        self.nr_pending.load(Ordering::Acquire)
    }

    pub(crate) fn inc_pending(&self) {
        self.nr_pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_pending(&self) {
        let prev = self.nr_pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pending underflow on {}", self.id);
    }

    /// Sectors rewritten after read errors on this device.
    pub fn corrected_errors(&self) -> u64 {
        self.corrected_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn add_corrected(&self, sectors: u64) {
        self.corrected_errors.fetch_add(sectors, Ordering::Relaxed);
    }

    /// Current (decayed) read error count.
    pub fn read_errors(&self) -> u32 {
        self.read_errors.load(Ordering::Acquire)
    }

    /// Records a read error at `now`, first halving the counter once for
    /// every full hour since the previous error. Returns the new count.
    pub(crate) fn record_read_error(&self, now: Instant) -> u32 {
        let mut last = self.last_read_error.lock();
        if let Some(prev) = *last {
            let hours = now.saturating_duration_since(prev).as_secs() / 3600;
            let current = self.read_errors.load(Ordering::Acquire);
            let decayed = if hours >= u32::BITS as u64 {
                0
            } else {
                current >> hours
            };
            self.read_errors.store(decayed, Ordering::Release);
        }
        *last = Some(now);
        self.read_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether dispatch must pause before touching this device.
    pub fn is_blocked(&self) -> bool {
        *self.blocked.lock()
    }

    /// Blocks or unblocks the device. Unblocking wakes every waiting dispatcher.
    pub fn set_blocked(&self, blocked: bool) {
        let mut guard = self.blocked.lock();
        *guard = blocked;
        if !blocked {
            self.unblocked.notify_all();
        }
        debug!(device = %self.id, blocked, "device block state changed");
    }

    /// Waits until the device is unblocked or `timeout` elapses.
    pub(crate) fn wait_unblocked(&self, timeout: Duration) {
        let mut guard = self.blocked.lock();
        if *guard {
            let _ = self.unblocked.wait_while_for(&mut guard, |b| *b, timeout);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("sectors", &self.sectors)
            .field("in_sync", &self.is_in_sync())
            .field("faulty", &self.is_faulty())
            .field("recovery_offset", &self.recovery_offset())
            .field("nr_pending", &self.nr_pending())
            .finish()
    }
}

/// One position in the array.
#[derive(Debug, Default)]
pub struct MirrorSlot {
    /// Primary device.
    pub rdev: Option<Arc<Device>>,
    /// Device being rebuilt to take over from `rdev`.
    pub replacement: Option<Arc<Device>>,
    /// Sector just after the last completed I/O, a seek-distance hint.
    pub head_position: AtomicU64,
    /// Recovery epoch in which recovery of this slot was abandoned.
    pub recovery_disabled: AtomicU64,
}

impl MirrorSlot {
    /// Creates a slot holding `rdev`.
    pub fn new(rdev: Option<Arc<Device>>) -> Self {
        Self {
            rdev,
            replacement: None,
            head_position: AtomicU64::new(0),
            recovery_disabled: AtomicU64::new(0),
        }
    }

    /// Primary device if present and not faulty.
    pub fn live_rdev(&self) -> Option<&Arc<Device>> {
        self.rdev.as_ref().filter(|d| !d.is_faulty())
    }

    /// Replacement device if present and not faulty.
    pub fn live_replacement(&self) -> Option<&Arc<Device>> {
        self.replacement.as_ref().filter(|d| !d.is_faulty())
    }

    /// Whether the slot holds a working, in-sync primary.
    pub fn is_working(&self) -> bool {
        self.live_rdev().is_some_and(|d| d.is_in_sync())
    }

    /// Whether the slot holds `id` as primary or replacement.
    pub fn holds(&self, id: DeviceId) -> bool {
        self.rdev.as_ref().is_some_and(|d| d.id() == id)
            || self.replacement.as_ref().is_some_and(|d| d.id() == id)
    }
}
