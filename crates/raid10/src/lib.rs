#![warn(missing_docs)]

//! Striped-mirror (RAID-10) redundancy engine.
//!
//! Write path: request → chunk split → replica set → every live replica (bad-block clamped)
//! Read path:  request → chunk split → balancer picks one replica → repair on error
//! Background: resync / check / repair / recovery behind the admission barrier

pub mod array;
pub mod badblocks;
mod balance;
pub mod barrier;
pub mod bitmap;
mod completion;
pub mod config;
pub mod device;
mod dispatch;
pub mod error;
pub mod geometry;
pub mod pool;
pub mod replica;
pub mod resync;
mod retry;
pub mod stats;
pub mod transport;

pub use array::Raid10;
pub use badblocks::{BadBlockOracle, BadRange, MemBadBlocks};
pub use barrier::{Barrier, BarrierState};
pub use bitmap::{ChunkState, MemBitmap, NoBitmap, WriteIntentBitmap};
pub use config::{LayoutSetting, RaidConfig};
pub use device::{Device, DeviceId, MirrorSlot, MAX_SECTOR};
pub use error::{RaidError, RaidResult};
pub use geometry::{Geometry, Layout, Replica, PAGE_SECTORS, SECTOR_SIZE};
pub use replica::RequestDone;
pub use resync::{SyncMode, SyncReport};
pub use stats::RaidStatsSnapshot;
pub use transport::{BlockTransport, CompletionFn, FaultRule, IoDirection, IoRecord, IoRequest, IoResult, MemTransport};
