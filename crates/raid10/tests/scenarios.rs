//! End-to-end scenarios over the in-memory transport.
//!
//! Each test assembles a small array, drives it through the public API and
//! checks both the logical result and what reached the member devices.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{builder, fill, TestArray};
use raid10::{
    BadBlockOracle, BadRange, DeviceId, FaultRule, IoDirection, MemBadBlocks, MemBitmap, Raid10,
    RaidConfig, RaidError, SyncMode, WriteIntentBitmap, MAX_SECTOR,
};

fn writes_of(t: &TestArray) -> Vec<(DeviceId, u64, u64)> {
    t.transport
        .log()
        .into_iter()
        .filter(|r| r.direction == IoDirection::Write && r.ok)
        .map(|r| (r.device, r.sector, r.sectors))
        .collect()
}

#[test]
fn test_write_lands_on_both_near_copies() {
    let t = common::array(4, "n2");
    t.array.write(100, fill(0xAB, 8)).unwrap();

    let mut writes = writes_of(&t);
    writes.sort();
    assert_eq!(writes, vec![(DeviceId(0), 100, 8), (DeviceId(1), 100, 8)]);
    for dev in [0, 1] {
        assert_eq!(
            t.transport.peek(DeviceId(dev), 100, 8).unwrap(),
            fill(0xAB, 8).to_vec()
        );
    }
    assert_eq!(t.array.read(100, 8).unwrap(), fill(0xAB, 8));
    assert_eq!(t.array.stats().writes, 1);
    assert_eq!(t.array.stats().reads, 1);
}

#[test]
fn test_far_layout_places_second_copy_half_way_down() {
    let t = common::array(4, "f2");
    let stride = t.array.geometry().stride();
    assert_eq!(stride, 4096);
    t.array.write(100, fill(1, 8)).unwrap();

    let mut writes = writes_of(&t);
    writes.sort();
    assert_eq!(
        writes,
        vec![(DeviceId(0), 100, 8), (DeviceId(1), 100 + stride, 8)]
    );
}

#[test]
fn test_degraded_array_keeps_serving_reads() {
    let t = common::array(4, "n2");
    t.array.write(0, fill(0x11, 64)).unwrap();
    assert!(t.array.fail_device(DeviceId(0)));
    assert_eq!(t.array.status(), "512K chunks 2 near-copies [4/3] [_UUU]");

    t.transport.clear_log();
    assert_eq!(t.array.read(0, 64).unwrap(), fill(0x11, 64));
    assert!(t
        .transport
        .log()
        .iter()
        .all(|r| r.device == DeviceId(1)));

    // Writes skip the failed member.
    t.transport.clear_log();
    t.array.write(0, fill(0x22, 8)).unwrap();
    assert_eq!(writes_of(&t), vec![(DeviceId(1), 0, 8)]);
}

#[test]
fn test_transient_read_error_is_rewritten_from_far_copy() {
    let t = common::array(4, "f2");
    let data = fill(0x5A, 8);
    t.array.write(500, data.clone()).unwrap();

    // The first read and the first repair read both fail, then the media recovers.
    t.transport
        .inject(FaultRule::read(DeviceId(0), 500, 8).times(2));
    t.transport.clear_log();
    assert_eq!(t.array.read(500, 8).unwrap(), data);

    let log = t.transport.log();
    assert!(log
        .iter()
        .any(|r| r.device == DeviceId(1) && r.direction == IoDirection::Read && r.ok));
    assert!(log
        .iter()
        .any(|r| r.device == DeviceId(0) && r.direction == IoDirection::Write && r.ok));
    let dev0 = t.array.device(DeviceId(0)).unwrap();
    assert_eq!(dev0.corrected_errors(), 8);
    assert!(!dev0.is_faulty());
    assert_eq!(t.array.stats().read_errors, 1);
    assert_eq!(t.array.barrier_state().nr_pending, 0);
    assert_eq!(t.array.barrier_state().nr_queued, 0);
}

#[test]
fn test_read_and_write_avoid_known_bad_range() {
    let t = common::array(4, "n2");
    let dev1 = t.array.device(DeviceId(1)).unwrap();
    dev1.set_write_error_seen();
    t.bad_blocks.set_bad(DeviceId(1), 200, 10);

    t.array.write(190, fill(0x33, 30)).unwrap();
    for (dev, sector, sectors) in writes_of(&t) {
        if dev == DeviceId(1) {
            assert!(sector + sectors <= 200 || sector >= 210);
        }
    }
    assert_eq!(t.array.read(190, 30).unwrap(), fill(0x33, 30));
    assert_eq!(
        t.bad_blocks.ranges(DeviceId(1)),
        vec![BadRange {
            first_bad: 200,
            sectors: 10
        }]
    );
}

#[test]
fn test_write_error_is_narrowed_to_bad_block() {
    let t = builder(4, "n2")
        .bad_blocks(MemBadBlocks::with_shift(Some(3)))
        .build();
    t.transport.inject(FaultRule::write(DeviceId(1), 9, 1));
    t.array.write(0, fill(0x44, 16)).unwrap();

    let dev1 = t.array.device(DeviceId(1)).unwrap();
    assert!(!dev1.is_faulty());
    assert!(dev1.write_error_seen());
    assert!(dev1.wants_replacement());
    assert_eq!(
        t.bad_blocks.ranges(DeviceId(1)),
        vec![BadRange {
            first_bad: 8,
            sectors: 8
        }]
    );
    assert_eq!(t.array.stats().bad_blocks_recorded, 1);
    assert_eq!(t.array.read(0, 16).unwrap(), fill(0x44, 16));
}

#[test]
fn test_unrecordable_write_error_fails_device() {
    let t = builder(4, "n2")
        .bad_blocks(MemBadBlocks::with_shift(None))
        .build();
    t.transport.inject(FaultRule::write(DeviceId(1), 0, 8));
    t.array.write(0, fill(0x55, 8)).unwrap();

    assert!(t.array.device(DeviceId(1)).unwrap().is_faulty());
    assert_eq!(t.array.stats().devices_failed, 1);
    assert_eq!(t.array.read(0, 8).unwrap(), fill(0x55, 8));
}

#[test]
fn test_blocked_device_holds_writes_until_released() {
    let TestArray { array, .. } = builder(4, "n2").config(|c| c.pool_size = 1).build();
    let array = Arc::new(array);
    let dev1 = array.device(DeviceId(1)).unwrap();
    dev1.set_blocked(true);

    let writer = {
        let array = Arc::clone(&array);
        thread::spawn(move || array.write(0, fill(0x66, 8)))
    };
    thread::sleep(Duration::from_millis(150));
    assert!(!writer.is_finished());

    // The parked write still owns the only foreground set.
    let err = array.read(4096, 8).unwrap_err();
    assert!(matches!(err, RaidError::PoolExhausted { .. }));
    assert!(err.is_retryable());

    dev1.set_blocked(false);
    writer.join().unwrap().unwrap();
    assert!(array.stats().write_restarts >= 1);
    assert_eq!(array.read(0, 8).unwrap(), fill(0x66, 8));
}

#[test]
fn test_unclean_start_resyncs_whole_array() {
    let t = builder(4, "n2").config(|c| c.start_clean = false).build();
    assert_eq!(t.array.resync_checkpoint(), 0);
    t.array.write(0, fill(0x77, 32)).unwrap();

    let report = t.array.run_sync(SyncMode::Resync).unwrap();
    assert!(!report.interrupted);
    assert_eq!(report.mismatches, 0);
    assert_eq!(report.synced_sectors, t.array.geometry().array_sectors());
    assert_eq!(t.array.resync_checkpoint(), MAX_SECTOR);
    assert_eq!(t.array.barrier_state().barrier, 0);
}

#[test]
fn test_bitmap_limits_resync_to_dirty_chunks() {
    let bitmap = Arc::new(MemBitmap::new(1024, 16384));
    let t = builder(4, "n2")
        .config(|c| c.start_clean = false)
        .bitmap(bitmap.clone())
        .build();
    // A degraded write left chunk 2 dirty.
    bitmap.start_write(2048, 8);
    bitmap.end_write(2048, 8, true);
    assert_eq!(bitmap.dirty_chunks(), 1);

    let report = t.array.run_sync(SyncMode::Resync).unwrap();
    assert_eq!(report.synced_sectors, 1024);
    assert_eq!(report.skipped_sectors, 16384 - 1024);
    assert_eq!(bitmap.dirty_chunks(), 0);
}

#[test]
fn test_unsyncable_chunk_is_released_when_resync_ends() {
    let bitmap = Arc::new(MemBitmap::new(1024, 16384));
    bitmap.mark_all_dirty();
    let t = builder(4, "n2").bitmap(bitmap.clone()).build();
    // Only one readable copy of chunk 0 while the range is bad.
    t.bad_blocks.set_bad(DeviceId(1), 0, 1024);

    let report = t.array.run_sync(SyncMode::Resync).unwrap();
    assert_eq!(report.skipped_sectors, 1024);
    let chunk0 = bitmap.chunk_state(0);
    assert!(chunk0.needed);
    assert!(!chunk0.syncing);
    assert_eq!(bitmap.dirty_chunks(), 1);

    t.bad_blocks.clear(DeviceId(1), 0, 1024);
    t.array.write(0, fill(0x0D, 8)).unwrap();
    assert!(!bitmap.chunk_state(0).syncing);
    assert_eq!(bitmap.dirty_chunks(), 0);
}

#[test]
fn test_check_reports_and_repair_fixes_divergence() {
    let t = common::array(4, "n2");
    t.array.write(0, fill(0x01, 64)).unwrap();
    assert!(t.transport.poke(DeviceId(1), 40, &fill(0xEE, 1)));

    let check = t.array.run_sync(SyncMode::Check).unwrap();
    assert!(check.mismatches > 0);
    assert_eq!(t.transport.peek(DeviceId(1), 40, 1).unwrap(), fill(0xEE, 1).to_vec());

    let repair = t.array.run_sync(SyncMode::Repair).unwrap();
    assert!(repair.mismatches > 0);
    assert_eq!(t.transport.peek(DeviceId(1), 40, 1).unwrap(), fill(0x01, 1).to_vec());

    assert_eq!(t.array.run_sync(SyncMode::Check).unwrap().mismatches, 0);
    assert!(t.array.stats().resync_mismatches > 0);
}

#[test]
fn test_spare_recovery_end_to_end() {
    let t = common::array(4, "n2");
    let chunk = t.array.geometry().chunk_sectors();
    assert!(t.array.fail_device(DeviceId(2)));
    t.array.remove_device(DeviceId(2)).unwrap();

    // Chunk 1 lives on slots 2 and 3; written while degraded.
    t.array.write(chunk, fill(0x99, 32)).unwrap();

    t.transport.add_disk(DeviceId(9), common::DEV_SECTORS);
    let slot = t
        .array
        .add_device(raid10::Device::new(DeviceId(9), common::DEV_SECTORS))
        .unwrap();
    assert_eq!(slot, 2);
    assert_eq!(t.array.status(), "512K chunks 2 near-copies [4/3] [UU_U]");

    let report = t.array.run_sync(SyncMode::Recovery).unwrap();
    assert!(!report.interrupted);
    assert_eq!(report.devices_activated, 1);
    assert_eq!(t.array.status(), "512K chunks 2 near-copies [4/4] [UUUU]");

    // Only the rebuilt device is left to serve chunk 1.
    assert!(t.array.fail_device(DeviceId(3)));
    assert_eq!(t.array.read(chunk, 32).unwrap(), fill(0x99, 32));
}

#[test]
fn test_writes_racing_a_resync_leave_replicas_identical() {
    let TestArray {
        array, transport, ..
    } = builder(4, "n2").config(|c| c.start_clean = false).build();
    let array = Arc::new(array);

    let writers: Vec<_> = (0..4u8)
        .map(|w| {
            let array = Arc::clone(&array);
            thread::spawn(move || {
                for i in 0..40u8 {
                    let sector = w as u64 * 2048 + (i as u64 % 8) * 64;
                    array.write(sector, fill(w * 64 + i, 16)).unwrap();
                }
            })
        })
        .collect();
    let resync = array.run_sync(SyncMode::Resync).unwrap();
    for w in writers {
        w.join().unwrap();
    }
    assert!(!resync.interrupted);

    let check = array.run_sync(SyncMode::Check).unwrap();
    assert_eq!(check.mismatches, 0);
    for (a, b) in [(0, 1), (2, 3)] {
        assert_eq!(
            transport.peek(DeviceId(a), 0, 4096),
            transport.peek(DeviceId(b), 0, 4096)
        );
    }
}

#[test]
fn test_config_from_json_offset_layout() {
    common::init_tracing();
    let config =
        RaidConfig::from_json(r#"{"raid_disks": 4, "layout": "o2", "chunk_sectors": 64}"#)
            .unwrap();
    let transport = raid10::MemTransport::new();
    let members = (0..4)
        .map(|i| {
            transport.add_disk(DeviceId(i), common::DEV_SECTORS);
            Some(raid10::Device::new(DeviceId(i), common::DEV_SECTORS))
        })
        .collect();
    let array = Raid10::new(
        config,
        transport.clone(),
        Arc::new(MemBadBlocks::new()),
        Arc::new(raid10::NoBitmap),
        members,
    )
    .unwrap();
    assert_eq!(array.status(), "32K chunks 2 offset-copies [4/4] [UUUU]");

    // Crosses a chunk boundary, so two pieces each with two copies.
    array.write(60, fill(0xC3, 8)).unwrap();
    assert_eq!(array.read(60, 8).unwrap(), fill(0xC3, 8));
    let writes = transport
        .log()
        .into_iter()
        .filter(|r| r.direction == IoDirection::Write)
        .count();
    assert_eq!(writes, 4);
}

#[test]
fn test_stopped_array_rejects_io() {
    let t = common::array(4, "n2");
    t.array.write(0, fill(1, 8)).unwrap();
    t.array.stop();
    assert!(matches!(
        t.array.write(0, fill(2, 8)),
        Err(RaidError::Stopped)
    ));
    assert!(matches!(
        t.array.run_sync(SyncMode::Check),
        Err(RaidError::Stopped)
    ));
}
