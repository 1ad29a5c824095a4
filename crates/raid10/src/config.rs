//! Array configuration.

use serde::{Deserialize, Serialize};

use crate::barrier::DEFAULT_RESYNC_DEPTH;
use crate::error::{RaidError, RaidResult};
use crate::geometry::{Geometry, Layout};

/// Layout as written in configuration: an explicit struct, the md layout
/// integer, or an mdadm-style name such as `"n2"` or `"o2"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayoutSetting {
    /// Explicit near/far/offset values.
    Explicit(Layout),
    /// md encoding `near | far << 8 | offset << 16`.
    Md(u32),
    /// mdadm-style name.
    Named(String),
}

impl LayoutSetting {
    /// Resolves the setting to a layout.
    pub fn resolve(&self) -> RaidResult<Layout> {
        match self {
            LayoutSetting::Explicit(layout) => Ok(*layout),
            LayoutSetting::Md(raw) => Layout::from_md(*raw),
            LayoutSetting::Named(name) => name.parse(),
        }
    }
}

impl Default for LayoutSetting {
    fn default() -> Self {
        LayoutSetting::Explicit(Layout::near2())
    }
}

/// Configuration for a RAID-10 array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaidConfig {
    /// Number of mirror slots. Default is 4.
    pub raid_disks: usize,
    /// Copy placement. Default is two near copies.
    pub layout: LayoutSetting,
    /// Chunk size in sectors. Default is 1024 (512 KiB).
    pub chunk_sectors: u64,
    /// Usable sectors per member device.
    pub dev_sectors: u64,
    /// Replica sets available to foreground I/O. Default is 256.
    pub pool_size: usize,
    /// Background chunks allowed in flight. Default is 32.
    pub resync_depth: u32,
    /// Largest resync or recovery window in sectors. Default is 128.
    pub resync_sectors: u64,
    /// Decayed read errors tolerated before a device is failed. Default is 20.
    pub max_read_errors: u32,
    /// Sectors between persisted sync checkpoints. Default is 65536.
    pub checkpoint_sectors: u64,
    /// Whether the array is known consistent at start. Default is true.
    pub start_clean: bool,
    /// How long a write waits on a blocked device before re-checking, in ms.
    pub blocked_wait_ms: u64,
}

impl Default for RaidConfig {
    fn default() -> Self {
        Self {
            raid_disks: 4,
            layout: LayoutSetting::default(),
            chunk_sectors: 1024,
            dev_sectors: 0,
            pool_size: 256,
            resync_depth: DEFAULT_RESYNC_DEPTH,
            resync_sectors: 128,
            max_read_errors: 20,
            checkpoint_sectors: 1 << 16,
            start_clean: true,
            blocked_wait_ms: 100,
        }
    }
}

impl RaidConfig {
    /// Parses a JSON configuration; absent fields take their defaults.
    pub fn from_json(json: &str) -> RaidResult<Self> {
        serde_json::from_str(json).map_err(|e| RaidError::Config {
            reason: e.to_string(),
        })
    }

    /// Validates tunables and derives the array geometry.
    pub fn geometry(&self) -> RaidResult<Geometry> {
        if self.pool_size == 0 {
            return Err(RaidError::Config {
                reason: "pool_size must be at least 1".to_string(),
            });
        }
        if self.resync_sectors == 0 || self.checkpoint_sectors == 0 {
            return Err(RaidError::Config {
                reason: "resync_sectors and checkpoint_sectors must be non-zero".to_string(),
            });
        }
        Geometry::new(
            self.raid_disks,
            self.layout.resolve()?,
            self.chunk_sectors,
            self.dev_sectors,
        )
    }
}
