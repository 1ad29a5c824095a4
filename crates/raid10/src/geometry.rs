//! Striped-mirror geometry: maps array (virtual) sectors to replica locations.
//!
//! A RAID-10 array stores `near_copies * far_copies` copies of every chunk.
//! Near copies sit on adjacent devices in the same row. Far copies repeat the
//! whole near pattern, shifted by `near_copies` devices, either in a distant
//! second pass of each device (`stride` sectors further on) or, with the
//! offset layout, in the very next row.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RaidError, RaidResult};

/// Size of a sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per page, the unit of synchronous repair I/O.
pub const PAGE_SECTORS: u64 = 8;

/// Copy placement of a RAID-10 array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    /// Copies on adjacent devices within a row.
    pub near_copies: u32,
    /// Copies placed in later passes across the device set.
    pub far_copies: u32,
    /// Far copies live in the adjacent row instead of a distant pass.
    pub far_offset: bool,
}

impl Layout {
    /// Classic RAID-10: two near copies.
    pub const fn near2() -> Self {
        Self {
            near_copies: 2,
            far_copies: 1,
            far_offset: false,
        }
    }

    /// Total number of copies of each chunk.
    pub fn copies(&self) -> u32 {
        self.near_copies * self.far_copies
    }

    /// Decodes the md layout integer: `near | far << 8 | offset << 16`.
    pub fn from_md(layout: u32) -> RaidResult<Self> {
        if layout >> 17 != 0 {
            return Err(RaidError::InvalidGeometry {
                reason: format!("unknown layout bits in {:#x}", layout),
            });
        }
        Ok(Self {
            near_copies: layout & 0xff,
            far_copies: (layout >> 8) & 0xff,
            far_offset: layout & (1 << 16) != 0,
        })
    }

    /// Encodes this layout as the md layout integer.
    pub fn to_md(&self) -> u32 {
        self.near_copies | (self.far_copies << 8) | if self.far_offset { 1 << 16 } else { 0 }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::near2()
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.near_copies > 1 {
            write!(f, "n{}", self.near_copies)?;
        }
        if self.far_copies > 1 {
            let tag = if self.far_offset { 'o' } else { 'f' };
            write!(f, "{}{}", tag, self.far_copies)?;
        }
        if self.copies() == 1 {
            write!(f, "n1")?;
        }
        Ok(())
    }
}

impl FromStr for Layout {
    type Err = RaidError;

    /// Parses mdadm-style layouts such as `n2`, `f2`, `o2` or `n2f2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || RaidError::Config {
            reason: format!("unrecognised layout '{}'", s),
        };
        let mut layout = Layout {
            near_copies: 1,
            far_copies: 1,
            far_offset: false,
        };
        let mut rest = s.trim();
        if rest.is_empty() {
            return Err(bad());
        }
        while !rest.is_empty() {
            let tag = rest.chars().next().ok_or_else(bad)?;
            let body = &rest[tag.len_utf8()..];
            let digits: String = body.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return Err(bad());
            }
            let n: u32 = digits.parse().map_err(|_| bad())?;
            match tag {
                'n' => layout.near_copies = n,
                'f' => layout.far_copies = n,
                'o' => {
                    layout.far_copies = n;
                    layout.far_offset = true;
                }
                _ => return Err(bad()),
            }
            rest = &body[digits.len()..];
        }
        Ok(layout)
    }
}

/// One physical copy of a virtual sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replica {
    /// Mirror slot (device index) holding the copy.
    pub devnum: usize,
    /// Physical sector on that device.
    pub addr: u64,
}

/// Immutable geometry of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    raid_disks: usize,
    layout: Layout,
    chunk_shift: u32,
    stride: u64,
    dev_sectors: u64,
    array_sectors: u64,
}

impl Geometry {
    /// Builds a geometry for devices of `device_sectors` usable sectors.
    pub fn new(
        raid_disks: usize,
        layout: Layout,
        chunk_sectors: u64,
        device_sectors: u64,
    ) -> RaidResult<Self> {
        if chunk_sectors < PAGE_SECTORS || !chunk_sectors.is_power_of_two() {
            return Err(RaidError::InvalidGeometry {
                reason: format!(
                    "chunk of {} sectors must be a power of two of at least {}",
                    chunk_sectors, PAGE_SECTORS
                ),
            });
        }
        if layout.near_copies == 0 || layout.far_copies == 0 {
            return Err(RaidError::InvalidGeometry {
                reason: "near and far copies must be at least 1".to_string(),
            });
        }
        if raid_disks == 0 || layout.copies() as usize > raid_disks {
            return Err(RaidError::InvalidGeometry {
                reason: format!(
                    "{} copies do not fit on {} devices",
                    layout.copies(),
                    raid_disks
                ),
            });
        }
        let chunk_shift = chunk_sectors.trailing_zeros();
        let rd = raid_disks as u64;
        let nc = layout.near_copies as u64;
        let fc = layout.far_copies as u64;

        // Chunks in the array, then chunks used per device (rounded up).
        let array_chunks = ((device_sectors >> chunk_shift) / fc) * rd / nc;
        let dev_chunks = (array_chunks * nc * fc).div_ceil(rd);
        let dev_sectors = dev_chunks << chunk_shift;
        let stride = if layout.far_offset {
            chunk_sectors
        } else {
            (dev_chunks / fc) << chunk_shift
        };
        let array_sectors = (((dev_chunks / fc) * rd) / nc) << chunk_shift;
        if array_sectors == 0 {
            return Err(RaidError::InvalidGeometry {
                reason: format!("devices of {} sectors hold no complete stripe", device_sectors),
            });
        }

        Ok(Self {
            raid_disks,
            layout,
            chunk_shift,
            stride,
            dev_sectors,
            array_sectors,
        })
    }

    /// Number of mirror slots.
    pub fn raid_disks(&self) -> usize {
        self.raid_disks
    }

    /// Copy placement.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Near copies per chunk.
    pub fn near_copies(&self) -> usize {
        self.layout.near_copies as usize
    }

    /// Far copies per chunk.
    pub fn far_copies(&self) -> usize {
        self.layout.far_copies as usize
    }

    /// Total copies per chunk.
    pub fn copies(&self) -> usize {
        self.layout.copies() as usize
    }

    /// Chunk size in sectors.
    pub fn chunk_sectors(&self) -> u64 {
        1 << self.chunk_shift
    }

    /// Per-device sector advance between far-copy passes.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Sectors used on each device.
    pub fn dev_sectors(&self) -> u64 {
        self.dev_sectors
    }

    /// Usable sectors of the whole array.
    pub fn array_sectors(&self) -> u64 {
        self.array_sectors
    }

    /// Sectors from `sector` to the end of its chunk.
    pub fn chunk_remainder(&self, sector: u64) -> u64 {
        self.chunk_sectors() - (sector & (self.chunk_sectors() - 1))
    }

    /// Whether requests must be split at chunk boundaries.
    pub fn splits_at_chunks(&self) -> bool {
        self.near_copies() < self.raid_disks
    }

    /// Returns every replica of `vsector`, near-major then far-minor.
    pub fn locate(&self, vsector: u64) -> Vec<Replica> {
        let chunk_mask = self.chunk_sectors() - 1;
        let offset = vsector & chunk_mask;
        let chunk = vsector >> self.chunk_shift;
        let rd = self.raid_disks as u64;
        let nc = self.layout.near_copies as u64;
        let fc = self.layout.far_copies as u64;

        let mut replicas = Vec::with_capacity(self.copies());
        for n in 0..nc {
            let pos = chunk * nc + n;
            let dev = pos % rd;
            let group = pos / rd;
            let row = if self.layout.far_offset { group * fc } else { group };
            let base = (row << self.chunk_shift) + offset;
            for f in 0..fc {
                replicas.push(Replica {
                    devnum: ((dev + f * nc) % rd) as usize,
                    addr: base + f * self.stride,
                });
            }
        }
        replicas
    }

    /// Maps a physical sector on `devnum` back to its virtual sector.
    ///
    /// Returns `None` when the location holds no replica, which happens in
    /// the unused tail of a partial last stripe.
    pub fn invert(&self, psector: u64, devnum: usize) -> Option<u64> {
        if devnum >= self.raid_disks || psector >= self.dev_sectors {
            return None;
        }
        let chunk_mask = self.chunk_sectors() - 1;
        let offset = psector & chunk_mask;
        let rd = self.raid_disks as i64;
        let nc = self.layout.near_copies as u64;
        let fc = self.layout.far_copies as u64;

        let (far, group) = if self.layout.far_offset {
            let row = psector >> self.chunk_shift;
            (row % fc, row / fc)
        } else {
            let far = psector / self.stride;
            (far, (psector - far * self.stride) >> self.chunk_shift)
        };
        if far >= fc {
            return None;
        }
        let dev = (devnum as i64 - (far * nc) as i64).rem_euclid(rd) as u64;
        let vchunk = (group * self.raid_disks as u64 + dev) / nc;
        let vsector = (vchunk << self.chunk_shift) + offset;
        (vsector < self.array_sectors).then_some(vsector)
    }

    /// Checks that every mirror group keeps at least one live member.
    ///
    /// Groups start every `near_copies` devices and span `copies` adjacent
    /// devices, which covers both near and far placement.
    pub fn covered(&self, live: impl Fn(usize) -> bool) -> bool {
        let mut first = 0;
        loop {
            let alive = (0..self.copies()).any(|i| live((first + i) % self.raid_disks));
            if !alive {
                return false;
            }
            first = (first + self.near_copies()) % self.raid_disks;
            if first == 0 {
                return true;
            }
        }
    }
}
