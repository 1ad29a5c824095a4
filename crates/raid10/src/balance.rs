//! Read replica selection.

use std::sync::Arc;

use tracing::trace;

use crate::array::ArrayCore;
use crate::device::{Device, MAX_SECTOR};
use crate::replica::{ReplicaSet, ReplicaSlot};

/// Replica picked for a read.
#[derive(Debug, Clone)]
pub struct ReadChoice {
    /// Index into the set's slots.
    pub slot: usize,
    /// Device to read; it holds one extra pending reference.
    pub device: Arc<Device>,
    /// Physical sector.
    pub addr: u64,
    /// Sectors readable from `addr` without touching a bad block.
    pub max_sectors: u64,
}

impl ArrayCore {
    /// Chooses the replica to read `set` from.
    ///
    /// Fills the set's slots from the geometry if empty. Slots flagged
    /// `io_blocked` are skipped. Returns `None` when no replica can serve
    /// the start of the range.
    pub(crate) fn read_balance(&self, set: &mut ReplicaSet) -> Option<ReadChoice> {
        if set.slots.is_empty() {
            set.slots = self
                .geo
                .locate(set.sector)
                .into_iter()
                .map(ReplicaSlot::new)
                .collect();
        }
        let mut sectors = set.sectors;
        let mirrors = self.mirrors.read();

        // Above the resync cursor replicas may disagree, so take the first
        // readable one instead of balancing.
        let do_balance = !(self.sync.recovery_cp() < MAX_SECTOR
            && set.sector + sectors >= self.sync.next_resync());

        let mut best_good_sectors = 0u64;
        let mut best_dist = u64::MAX;
        let mut best_dist_pick: Option<(usize, Arc<Device>)> = None;
        let mut best_pending_pick: Option<(usize, Arc<Device>)> = None;
        let mut min_pending = u32::MAX;
        let mut has_nonrot = false;
        let mut forced: Option<(usize, Arc<Device>)> = None;

        for (idx, slot) in set.slots.iter().enumerate() {
            if slot.io_blocked {
                continue;
            }
            let mirror = &mirrors[slot.devnum];
            // A replacement serves the read once it has recovered past it.
            let rdev = match mirror.live_replacement() {
                Some(r) if slot.addr + sectors <= r.recovery_offset() => r,
                _ => match mirror.live_rdev() {
                    Some(r) => r,
                    None => continue,
                },
            };
            if !rdev.is_in_sync() && slot.addr + sectors > rdev.recovery_offset() {
                continue;
            }

            if let Some(bad) = self.bad_blocks.query(rdev.id(), slot.addr, sectors) {
                if best_dist < u64::MAX {
                    continue;
                }
                if bad.first_bad <= slot.addr {
                    // Cannot read here; nothing may be read past the bad run.
                    let bad_sectors = bad.sectors - (slot.addr - bad.first_bad);
                    if !do_balance && sectors > bad_sectors {
                        sectors = bad_sectors;
                    }
                    if best_good_sectors > sectors {
                        best_good_sectors = sectors;
                    }
                } else {
                    let good = bad.first_bad - slot.addr;
                    if good > best_good_sectors {
                        best_good_sectors = good;
                        best_dist_pick = Some((idx, Arc::clone(rdev)));
                    }
                    if !do_balance {
                        forced = Some((idx, Arc::clone(rdev)));
                        break;
                    }
                }
                continue;
            }
            best_good_sectors = sectors;

            if !do_balance {
                forced = Some((idx, Arc::clone(rdev)));
                break;
            }

            let pending = rdev.nr_pending();
            if rdev.is_nonrotational() {
                has_nonrot = true;
                if pending < min_pending {
                    min_pending = pending;
                    best_pending_pick = Some((idx, Arc::clone(rdev)));
                }
            }
            let distance = if self.geo.near_copies() > 1 && pending == 0 {
                0
            } else if self.geo.far_copies() > 1 {
                slot.addr
            } else {
                slot.addr
                    .abs_diff(mirror.head_position.load(std::sync::atomic::Ordering::Relaxed))
            };
            if distance < best_dist {
                best_dist = distance;
                best_dist_pick = Some((idx, Arc::clone(rdev)));
            }
        }
        drop(mirrors);

        let (slot, device) = match forced {
            Some(pick) => pick,
            None if has_nonrot => best_pending_pick?,
            None => best_dist_pick?,
        };
        device.inc_pending();
        set.read_slot = Some(slot);
        set.read_dev = Some(Arc::clone(&device));
        let addr = set.slots[slot].addr;
        trace!(
            sector = set.sector,
            device = %device.id(),
            addr,
            max_sectors = best_good_sectors,
            "read balanced"
        );
        Some(ReadChoice {
            slot,
            device,
            addr,
            max_sectors: best_good_sectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::tests::{mem_array, mem_array_with};
    use crate::badblocks::BadBlockOracle;
    use crate::device::DeviceId;
    use crate::replica::SetKind;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_picks_one_of_the_near_pair() {
        let (array, _t, _bb) = mem_array(4);
        let core = array.core();
        let mut set = ReplicaSet::new(SetKind::Read, 100, 8);
        let choice = core.read_balance(&mut set).unwrap();
        assert!(choice.device.id() == DeviceId(0) || choice.device.id() == DeviceId(1));
        assert_eq!(choice.addr, 100);
        assert_eq!(choice.max_sectors, 8);
        assert_eq!(choice.device.nr_pending(), 1);
        choice.device.dec_pending();
    }

    #[test]
    fn test_skips_faulty_and_blocked_slots() {
        let (array, _t, _bb) = mem_array(4);
        let core = array.core();
        core.mirrors.read()[0].rdev.as_ref().unwrap().set_faulty();
        let mut set = ReplicaSet::new(SetKind::Read, 0, 8);
        let choice = core.read_balance(&mut set).unwrap();
        assert_eq!(choice.device.id(), DeviceId(1));
        choice.device.dec_pending();

        set.slots[1].io_blocked = true;
        assert!(core.read_balance(&mut set).is_none());
    }

    #[test]
    fn test_bad_block_limits_length() {
        let (array, _t, bb) = mem_array(4);
        let core = array.core();
        bb.set_bad(DeviceId(0), 104, 4);
        bb.set_bad(DeviceId(1), 100, 2);
        let mut set = ReplicaSet::new(SetKind::Read, 100, 8);
        let choice = core.read_balance(&mut set).unwrap();
        // Device 0 offers 4 good sectors, device 1 none at the start.
        assert_eq!(choice.device.id(), DeviceId(0));
        assert_eq!(choice.max_sectors, 4);
        choice.device.dec_pending();
    }

    #[test]
    fn test_nearest_head_wins_when_busy() {
        let (array, _t, _bb) = mem_array(4);
        let core = array.core();
        {
            let mirrors = core.mirrors.read();
            mirrors[0].head_position.store(5000, Ordering::Relaxed);
            mirrors[1].head_position.store(300, Ordering::Relaxed);
            // Both busy so the zero-distance shortcut does not apply.
            mirrors[0].rdev.as_ref().unwrap().inc_pending();
            mirrors[1].rdev.as_ref().unwrap().inc_pending();
        }
        let mut set = ReplicaSet::new(SetKind::Read, 256, 8);
        let choice = core.read_balance(&mut set).unwrap();
        assert_eq!(choice.device.id(), DeviceId(1));
    }

    #[test]
    fn test_unrecovered_spare_is_not_read() {
        let (array, _t, _bb) = mem_array_with(4, |id| {
            if id == 0 {
                Device::spare(DeviceId(id), 8192)
            } else {
                Device::new(DeviceId(id), 8192)
            }
        });
        let core = array.core();
        let mut set = ReplicaSet::new(SetKind::Read, 0, 8);
        let choice = core.read_balance(&mut set).unwrap();
        assert_eq!(choice.device.id(), DeviceId(1));
        choice.device.dec_pending();
    }
}
