//! Replica sub-request sets and the logical requests they serve.
//!
//! A [`ReplicaSet`] covers one contiguous range and tracks every per-device
//! I/O issued for it. Foreground sets belong to a [`MasterRequest`], which
//! joins the pieces of a logical request split at chunk or bad-block
//! boundaries and fires the caller's completion exactly once.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::device::Device;
use crate::error::{RaidError, RaidResult};
use crate::geometry::{Replica, SECTOR_SIZE};

/// State bits of a replica set.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SetFlags(u8);

impl SetFlags {
    /// At least one replica returned good data, or a write reached an in-sync device.
    pub const UPTODATE: SetFlags = SetFlags(1 << 0);
    /// A write skipped a missing or faulty replica.
    pub const DEGRADED: SetFlags = SetFlags(1 << 1);
    /// A replica write failed and needs narrowing.
    pub const WRITE_ERROR: SetFlags = SetFlags(1 << 2);
    /// A replica read failed and needs repair.
    pub const READ_ERROR: SetFlags = SetFlags(1 << 3);
    /// A write landed on a range recorded as bad.
    pub const MADE_GOOD: SetFlags = SetFlags(1 << 4);
    /// Resync, check or repair chunk.
    pub const IS_SYNC: SetFlags = SetFlags(1 << 5);
    /// Recovery chunk.
    pub const IS_RECOVER: SetFlags = SetFlags(1 << 6);

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: SetFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: SetFlags) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: SetFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for SetFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 7] = [
            "UPTODATE",
            "DEGRADED",
            "WRITE_ERROR",
            "READ_ERROR",
            "MADE_GOOD",
            "IS_SYNC",
            "IS_RECOVER",
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.0 & (1 << i) != 0)
            .map(|(_, n)| *n)
            .collect();
        write!(f, "SetFlags({})", set.join("|"))
    }
}

/// Outcome of the I/O issued to one device of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotIo {
    /// Nothing issued.
    #[default]
    Idle,
    /// Read in flight.
    Reading,
    /// Read returned data.
    ReadOk,
    /// Read failed.
    ReadFailed,
    /// Write in flight.
    Writing,
    /// Write succeeded.
    WriteOk,
    /// Write failed.
    WriteFailed,
    /// Write succeeded over a range recorded as bad.
    MadeGood,
}

/// One replica location and the I/O issued to it.
#[derive(Debug, Clone)]
pub struct ReplicaSlot {
    /// Mirror slot index.
    pub devnum: usize,
    /// Physical sector.
    pub addr: u64,
    /// Excluded from further read attempts.
    pub io_blocked: bool,
    /// Primary device holding a pending reference for this set.
    pub primary: Option<Arc<Device>>,
    /// Primary I/O outcome.
    pub primary_io: SlotIo,
    /// Replacement device holding a pending reference for this set.
    pub replacement: Option<Arc<Device>>,
    /// Replacement I/O outcome.
    pub replacement_io: SlotIo,
    /// Data read from this replica (sync sets only).
    pub data: Bytes,
}

impl ReplicaSlot {
    /// Creates an idle slot for `replica`.
    pub fn new(replica: Replica) -> Self {
        Self {
            devnum: replica.devnum,
            addr: replica.addr,
            io_blocked: false,
            primary: None,
            primary_io: SlotIo::Idle,
            replacement: None,
            replacement_io: SlotIo::Idle,
            data: Bytes::new(),
        }
    }
}

/// What a set is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    /// Foreground read.
    Read,
    /// Foreground write.
    Write,
    /// Background resync, check, repair or recovery.
    Sync,
}

/// Source and target of a recovery set.
///
/// The source device is the set's `read_dev`; it may sit in the target slot
/// when only a replacement is being rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Index into `slots` of the replica being read.
    pub source: usize,
    /// Index into `slots` of the replica being rebuilt.
    pub target: usize,
}

impl RecoveryPlan {
    /// Writes the set will issue: one per rebuilt device in the target slot.
    pub fn writes(&self, slots: &[ReplicaSlot]) -> u32 {
        slots
            .get(self.target)
            .map(|s| s.primary.is_some() as u32 + s.replacement.is_some() as u32)
            .unwrap_or(0)
    }
}

/// Per-range bookkeeping for one wave of replica I/O.
#[derive(Debug)]
pub struct ReplicaSet {
    /// Kind of work.
    pub kind: SetKind,
    /// First virtual sector.
    pub sector: u64,
    /// Length in sectors.
    pub sectors: u64,
    /// State bits.
    pub flags: SetFlags,
    /// Replica locations, near-major then far-minor.
    pub slots: Vec<ReplicaSlot>,
    /// Slot chosen for a read, or the authoritative slot of a resync.
    pub read_slot: Option<usize>,
    /// Device the read went to.
    pub read_dev: Option<Arc<Device>>,
    /// Logical request this set belongs to.
    pub master: Option<Arc<MasterRequest>>,
    /// Data to write (foreground writes).
    pub payload: Bytes,
    /// Recovery source and target.
    pub recovery: Option<RecoveryPlan>,
}

impl ReplicaSet {
    /// Creates an empty set for `[sector, sector + sectors)`.
    pub fn new(kind: SetKind, sector: u64, sectors: u64) -> Self {
        Self {
            kind,
            sector,
            sectors,
            flags: SetFlags::default(),
            slots: Vec::new(),
            read_slot: None,
            read_dev: None,
            master: None,
            payload: Bytes::new(),
            recovery: None,
        }
    }

    /// Attaches the logical request.
    pub fn with_master(mut self, master: Arc<MasterRequest>) -> Self {
        self.master = Some(master);
        self
    }

    /// Byte offset of this set within its logical request.
    pub fn master_offset(&self) -> usize {
        self.master
            .as_ref()
            .map(|m| (self.sector - m.sector) as usize * SECTOR_SIZE)
            .unwrap_or(0)
    }

    /// Length in bytes.
    pub fn len_bytes(&self) -> usize {
        self.sectors as usize * SECTOR_SIZE
    }
}

/// Final completion of a logical request.
pub type RequestDone = Box<dyn FnOnce(RaidResult<Bytes>) + Send + 'static>;

/// A logical read or write split into one or more replica sets.
pub struct MasterRequest {
    /// First virtual sector.
    pub sector: u64,
    /// Length in sectors.
    pub sectors: u64,
    /// Direction.
    pub kind: SetKind,
    /// Data to write.
    pub payload: Bytes,
    buffer: Mutex<Vec<u8>>,
    pieces: AtomicU32,
    error: Mutex<Option<RaidError>>,
    done: Mutex<Option<RequestDone>>,
}

impl MasterRequest {
    /// Creates a read of `sectors` sectors at `sector`.
    pub fn read(sector: u64, sectors: u64, done: RequestDone) -> Arc<Self> {
        Arc::new(Self {
            sector,
            sectors,
            kind: SetKind::Read,
            payload: Bytes::new(),
            buffer: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            // The dispatcher holds one piece until every set is issued.
            pieces: AtomicU32::new(1),
            error: Mutex::new(None),
            done: Mutex::new(Some(done)),
        })
    }

    /// Creates a write of `payload` at `sector`.
    pub fn write(sector: u64, payload: Bytes, done: RequestDone) -> Arc<Self> {
        Arc::new(Self {
            sector,
            sectors: (payload.len() / SECTOR_SIZE) as u64,
            kind: SetKind::Write,
            payload,
            buffer: Mutex::new(Vec::new()),
            pieces: AtomicU32::new(1),
            error: Mutex::new(None),
            done: Mutex::new(Some(done)),
        })
    }

    /// Registers one more outstanding set.
    pub fn add_piece(&self) {
        self.pieces.fetch_add(1, Ordering::AcqRel);
    }

    /// Copies read data for the set starting `offset` bytes in.
    pub fn fill(&self, offset: usize, data: &[u8]) {
        let mut buf = self.buffer.lock();
        if let Some(dst) = buf.get_mut(offset..offset + data.len()) {
            dst.copy_from_slice(data);
        }
    }

    /// Records a failed piece; the first error is reported.
    pub fn fail(&self, err: RaidError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Whether any piece has failed.
    pub fn failed(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Releases one piece. Returns true when this was the last one and the
    /// caller's completion has run.
    pub fn put_piece(&self) -> bool {
        if self.pieces.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        let result = match self.error.lock().take() {
            Some(err) => Err(err),
            None => match self.kind {
                SetKind::Read => Ok(Bytes::from(std::mem::take(&mut *self.buffer.lock()))),
                _ => Ok(Bytes::new()),
            },
        };
        if let Some(done) = self.done.lock().take() {
            done(result);
        }
        true
    }
}

impl fmt::Debug for MasterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterRequest")
            .field("sector", &self.sector)
            .field("sectors", &self.sectors)
            .field("kind", &self.kind)
            .field("pieces", &self.pieces.load(Ordering::Acquire))
            .finish()
    }
}
