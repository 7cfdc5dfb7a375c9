//! End-to-end scenarios for the zone manager against the in-memory zoned
//! device.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use stratafs_zbd::{
    IoType, MockZonedDevice, WriteLifetime, ZbdConfig, ZbdError, ZoneBackend, ZoneManager,
};

const ZONE_SIZE: u64 = 4096 * 16;
const BLOCK: usize = 4096;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn device(nr_zones: u32) -> Arc<MockZonedDevice> {
    Arc::new(MockZonedDevice::new(nr_zones, ZONE_SIZE, BLOCK as u32).with_caps(14, 14))
}

fn open(dev: &Arc<MockZonedDevice>, config: ZbdConfig) -> ZoneManager {
    let backend: Arc<dyn ZoneBackend> = Arc::clone(dev) as Arc<dyn ZoneBackend>;
    ZoneManager::open(backend, config, false, true).unwrap()
}

fn config_l5() -> ZbdConfig {
    ZbdConfig {
        lifetime_begin: 3,
        lifetime_levels: 5,
        ..Default::default()
    }
}

#[test]
fn test_startup_seeds_buckets_and_partitions_zones() {
    init_tracing();
    let dev = device(64);
    let manager = open(&dev, config_l5());

    assert_eq!(manager.meta_zone_count(), 3);
    assert_eq!(manager.io_zone_count(), 61);
    assert_eq!(manager.open_io_zone_count(), 5);
    assert_eq!(manager.active_io_zone_count(), 5);

    // One empty zone per bucket, classes 3 through 7, all distinct.
    let seeded: Vec<_> = manager
        .zone_snapshot()
        .into_iter()
        .filter(|z| z.lifetime.is_set())
        .collect();
    assert_eq!(seeded.len(), 5);
    let classes: HashSet<u8> = seeded.iter().map(|z| z.lifetime.as_u8()).collect();
    assert_eq!(classes, (3..8).collect::<HashSet<u8>>());
    assert!(seeded.iter().all(|z| z.wp == z.start));
}

#[test]
fn test_same_lifetime_allocation_reuses_seeded_zone() {
    init_tracing();
    let dev = device(64);
    let manager = open(&dev, config_l5());

    let seeded_start = manager
        .zone_snapshot()
        .into_iter()
        .find(|z| z.lifetime == WriteLifetime::LONG)
        .map(|z| z.start)
        .unwrap();

    let handle = manager
        .allocate_io_zone(WriteLifetime::LONG, IoType::Flush, 42)
        .unwrap();
    assert_eq!(handle.start(), seeded_start);
    assert_eq!(manager.open_io_zone_count(), 5);
    assert_eq!(manager.bucket_idle_count(WriteLifetime::LONG), Some(0));
}

#[test]
fn test_wal_writes_pinned_to_lowest_class() {
    init_tracing();
    let dev = device(64);
    let config = config_l5();
    let wal_file_id = config.wal_file_id;
    let manager = open(&dev, config);

    let handle = manager
        .allocate_io_zone(WriteLifetime::NONE, IoType::Wal, wal_file_id)
        .unwrap();
    assert_eq!(handle.lifetime(), WriteLifetime::new(3));
    assert_eq!(manager.bucket_idle_count(WriteLifetime::new(3)), Some(0));
}

#[test]
fn test_low_hint_data_pinned_to_top_class() {
    init_tracing();
    let dev = device(64);
    let manager = open(&dev, config_l5());

    // Only classes 3..=7 are seeded, but the rewrite target is the top of
    // the scale regardless of the configured level count; its bucket is
    // populated on first use.
    let handle = manager
        .allocate_io_zone(WriteLifetime::NONE, IoType::Flush, 7)
        .unwrap();
    assert_eq!(handle.lifetime(), WriteLifetime::new(8));
    assert_eq!(manager.bucket_len(WriteLifetime::new(8)), Some(1));
    assert_eq!(manager.bucket_idle_count(WriteLifetime::new(8)), Some(0));
    assert_eq!(manager.open_io_zone_count(), 6);
}

#[test]
fn test_finish_threshold_harvests_near_full_zone() {
    init_tracing();
    let dev = device(64);
    // 85% written before open; with a 20% threshold the zone is finished
    // on the next data allocation, refunding one active token.
    dev.fill_zone(40, 14 * BLOCK as u64);
    let config = ZbdConfig {
        finish_threshold: 20,
        ..config_l5()
    };
    let manager = open(&dev, config);

    let recovered = manager.io_zone_at(40 * ZONE_SIZE).unwrap();
    recovered.add_used(BLOCK as u64);
    assert!(!recovered.is_full());
    assert_eq!(manager.active_io_zone_count(), 6);

    let _handle = manager
        .allocate_io_zone(WriteLifetime::MEDIUM, IoType::Flush, 11)
        .unwrap();

    assert!(recovered.is_full());
    assert_eq!(manager.active_io_zone_count(), 5);
}

#[test]
fn test_invalidated_full_zone_is_reset_and_bucket_reseeded() {
    init_tracing();
    let dev = device(64);
    let manager = open(&dev, config_l5());
    let open_before = manager.open_io_zone_count();

    let handle = manager
        .allocate_io_zone(WriteLifetime::new(6), IoType::Compaction, 13)
        .unwrap();
    let start = handle.start();
    handle.append(&vec![0xCDu8; ZONE_SIZE as usize]).unwrap();
    handle.add_used(ZONE_SIZE);
    assert!(handle.is_full());
    drop(handle);

    // Still bucketed while its data is live, but never handed out again.
    assert_eq!(manager.bucket_idle_count(WriteLifetime::new(6)), Some(0));

    manager.io_zone_at(start).unwrap().sub_used(ZONE_SIZE);
    manager.reset_unused_io_zones().unwrap();

    let zone = manager.io_zone_at(start).unwrap();
    assert!(zone.is_empty());
    assert_eq!(manager.bucket_len(WriteLifetime::new(6)), Some(1));
    assert_eq!(manager.bucket_idle_count(WriteLifetime::new(6)), Some(1));
    assert_eq!(manager.open_io_zone_count(), open_before);
}

#[test]
fn test_appended_bytes_read_back() {
    init_tracing();
    let dev = device(64);
    let manager = open(&dev, config_l5());

    let handle = manager
        .allocate_io_zone(WriteLifetime::MEDIUM, IoType::Flush, 3)
        .unwrap();
    let data: Vec<u8> = (0..BLOCK * 2).map(|i| (i % 251) as u8).collect();
    let offset = handle.wp();
    handle.append(&data).unwrap();
    drop(handle);

    let mut buf = vec![0u8; data.len()];
    let n = manager.read(&mut buf, offset, true).unwrap();
    assert_eq!(n, data.len());
    assert_eq!(buf, data);
    assert_eq!(manager.bytes_written(), data.len() as u64);
}

#[test]
fn test_append_boundaries() {
    init_tracing();
    let dev = device(64);
    let manager = open(&dev, config_l5());

    let handle = manager
        .allocate_io_zone(WriteLifetime::MEDIUM, IoType::Flush, 3)
        .unwrap();

    let err = handle
        .append(&vec![0u8; ZONE_SIZE as usize + BLOCK])
        .unwrap_err();
    assert!(matches!(err, ZbdError::NoSpace { .. }));
    assert!(handle.is_empty(), "oversized append must not touch the zone");

    let err = handle.append(&vec![0u8; BLOCK + 1]).unwrap_err();
    assert!(matches!(err, ZbdError::InvalidArgument { .. }));
}

#[test]
fn test_write_error_surfaces_and_latch_turns_read_only() {
    init_tracing();
    let dev = device(64);
    let manager = open(&dev, config_l5());

    let handle = manager
        .allocate_io_zone(WriteLifetime::MEDIUM, IoType::Flush, 3)
        .unwrap();
    dev.set_fail_writes(true);
    let err = handle.append(&vec![0u8; BLOCK]).unwrap_err();
    assert!(matches!(err, ZbdError::Io(_)));
    dev.set_fail_writes(false);

    // A background discovery of the failure forces later allocations to
    // fail until teardown.
    manager.set_deferred_status(err);
    drop(handle);
    let err = manager
        .allocate_io_zone(WriteLifetime::MEDIUM, IoType::Flush, 3)
        .unwrap_err();
    assert!(matches!(err, ZbdError::Io(_)));
}

#[test]
fn test_readonly_open_does_not_seed_or_close_zones() {
    init_tracing();
    let dev = device(64);
    dev.fill_zone(30, 2 * BLOCK as u64);
    let backend: Arc<dyn ZoneBackend> = Arc::clone(&dev) as Arc<dyn ZoneBackend>;
    let manager = ZoneManager::open(backend, config_l5(), true, false).unwrap();

    assert!(manager.readonly());
    assert_eq!(manager.open_io_zone_count(), 0);
    assert_eq!(manager.active_io_zone_count(), 1);
    assert_eq!(manager.bucket_len(WriteLifetime::MEDIUM), Some(0));
    // The device-open zone is left open.
    assert!(dev.list_zones().unwrap()[30].is_open);
}

#[test]
fn test_busy_flag_is_exclusive_under_contention() {
    init_tracing();
    let dev = device(64);
    let manager = Arc::new(open(&dev, config_l5()));
    let zone = manager.io_zone_at(40 * ZONE_SIZE).unwrap();

    let holders = Arc::new(AtomicU32::new(0));
    let overlap = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();
    for _ in 0..8 {
        let zone = Arc::clone(&zone);
        let holders = Arc::clone(&holders);
        let overlap = Arc::clone(&overlap);
        threads.push(thread::spawn(move || {
            for _ in 0..500 {
                if let Some(lease) = zone.try_acquire() {
                    if holders.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    std::hint::spin_loop();
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(lease);
                }
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    assert!(
        !overlap.load(Ordering::SeqCst),
        "two owners observed the busy flag at once"
    );
}

#[test]
fn test_concurrent_allocator_stress_holds_caps() {
    init_tracing();
    let dev = device(96);
    let manager = Arc::new(open(&dev, ZbdConfig::default()));
    let max_open = 12u32;
    let max_active = 12u32;

    let done = Arc::new(AtomicBool::new(false));
    // A GC-worker stand-in keeps resetting fully-written zones so the
    // writers can never wedge on retired zones pinning the whole budget.
    let janitor = {
        let manager = Arc::clone(&manager);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                manager.reset_unused_io_zones().unwrap();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let mut writers = Vec::new();
    for t in 0..6u64 {
        let manager = Arc::clone(&manager);
        writers.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for i in 0..40u64 {
                let class = WriteLifetime::new(rng.gen_range(3..=8));
                let io_type = if t == 0 { IoType::Wal } else { IoType::Flush };
                let handle = manager
                    .allocate_io_zone(class, io_type, t * 1000 + i)
                    .unwrap();
                let blocks: usize = rng.gen_range(1..=4);
                let len = (BLOCK * blocks).min(handle.capacity() as usize);
                if len > 0 {
                    handle.append(&vec![t as u8; len]).unwrap();
                }
                assert!(manager.open_io_zone_count() <= max_open);
                assert!(manager.active_io_zone_count() <= max_active);
                drop(handle);
            }
        }));
    }
    for t in writers {
        t.join().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    janitor.join().unwrap();

    assert!(manager.open_io_zone_count() <= max_open);
    assert!(manager.active_io_zone_count() <= max_active);

    // Every zone still satisfies the capacity identity.
    for z in manager.zone_snapshot() {
        assert_eq!(z.wp - z.start + z.capacity, z.max_capacity);
    }
}
