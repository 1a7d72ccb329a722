//! Ring behavior of the log device: wrap-around after reclamation,
//! exhaustion without reclamation, and replay across the wrap point.
//!
//! These tests wire the storage stack by hand with a deliberately tiny
//! logdev region so the ring geometry is exercised within a few dozen
//! batches.

use bytes::Bytes;
use hearth_common::{DeviceType, DriveAttributes, Error, VdevKind};
use hearth_logstore::logdev::LOGDEV_META_NAME;
use hearth_logstore::service::LOGSTORE_META_NAME;
use hearth_logstore::{LogDev, LogDevConfig, LogStoreService};
use hearth_storage::{BlkStore, BlockCache, CacheMode, DeviceManager, MetaBlkMgr, MetaCookie, Vdev};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const LOGDEV_SIZE: u64 = 128 << 10; // 32 pages

struct Harness {
    mgr: Arc<DeviceManager>,
    svc: Arc<LogStoreService>,
}

fn make_device(dir: &TempDir) -> Vec<PathBuf> {
    let path = dir.path().join("dev0");
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(32 << 20).unwrap();
    vec![path]
}

fn build(paths: &[PathBuf]) -> Harness {
    let mut mgr = DeviceManager::new(DriveAttributes::default(), DeviceType::File);
    let first_boot = mgr.add_devices(paths, true).unwrap();
    let mgr = Arc::new(mgr);
    let cache = Arc::new(BlockCache::new(1 << 20));

    let recovered: Arc<Mutex<HashMap<&'static str, (Bytes, MetaCookie)>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let meta = Arc::new(MetaBlkMgr::new());
    for name in [LOGDEV_META_NAME, LOGSTORE_META_NAME] {
        let recovered2 = recovered.clone();
        meta.register_handler(
            name,
            Arc::new(move |blob, cookie| {
                recovered2.lock().insert(name, (blob, cookie));
            }),
            None,
        );
    }

    let (logdev_rec, meta_rec) = if first_boot {
        let lr = mgr
            .register_vdev(LOGDEV_SIZE, 4096, 0, &VdevKind::LogDev.encode())
            .unwrap();
        let mr = mgr
            .register_vdev(1 << 20, 4096, 0, &VdevKind::Meta.encode())
            .unwrap();
        (lr, mr)
    } else {
        let mut lr = None;
        let mut mr = None;
        mgr.enumerate_vdevs(|record| {
            match VdevKind::decode(&record.context).unwrap() {
                VdevKind::LogDev => lr = Some(record.clone()),
                VdevKind::Meta => mr = Some(record.clone()),
                _ => {}
            }
            Ok(())
        })
        .unwrap();
        (lr.unwrap(), mr.unwrap())
    };

    let logdev_store = Arc::new(BlkStore::new(
        "logdev",
        Vdev::new(mgr.clone(), &logdev_rec),
        cache.clone(),
        CacheMode::PassThru,
        None,
    ));
    let meta_store = Arc::new(BlkStore::new(
        "meta",
        Vdev::new(mgr.clone(), &meta_rec),
        cache,
        CacheMode::PassThru,
        None,
    ));
    meta.start(meta_store, first_boot).unwrap();

    let sb = recovered.lock().remove(LOGDEV_META_NAME);
    let registry = recovered.lock().remove(LOGSTORE_META_NAME);
    let cfg = LogDevConfig {
        auto_flush: false,
        ..Default::default()
    };
    let logdev = LogDev::new(logdev_store, meta.clone(), cfg, sb).unwrap();
    let svc = LogStoreService::new(logdev, meta, registry).unwrap();
    Harness { mgr, svc }
}

fn body() -> Bytes {
    Bytes::from(vec![0x42_u8; 2500])
}

#[test]
fn ring_wraps_after_reclamation() {
    let dir = TempDir::new().unwrap();
    let paths = make_device(&dir);
    let h = build(&paths);
    let store = h.svc.create_log_store(true).unwrap();

    // One single-record batch per page, most of the region
    for _ in 0..30 {
        store.append_async(body(), 0, None).unwrap();
        h.svc.logdev().flush().unwrap();
    }
    store.truncate(24, true).unwrap();
    h.svc.device_truncate().unwrap().expect("boundary exists");

    // The reclaimed head is reused via wrap-around
    for _ in 30..40 {
        store.append_async(body(), 0, None).unwrap();
        h.svc.logdev().flush().unwrap();
    }

    assert_eq!(store.read_sync(25).unwrap(), body());
    assert_eq!(store.read_sync(39).unwrap(), body());
    assert!(matches!(store.read_sync(24), Err(Error::OutOfRange(_))));
}

#[test]
fn full_ring_without_reclamation_is_out_of_space() {
    let dir = TempDir::new().unwrap();
    let paths = make_device(&dir);
    let h = build(&paths);
    let store = h.svc.create_log_store(true).unwrap();

    let mut full = false;
    for _ in 0..40 {
        store.append_async(body(), 0, None).unwrap();
        match h.svc.logdev().flush() {
            Ok(_) => {}
            Err(Error::OutOfSpace) => {
                full = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(full, "an unreclaimed ring must eventually fill up");
}

#[test]
fn replay_crosses_the_wrap_point() {
    let dir = TempDir::new().unwrap();
    let paths = make_device(&dir);

    {
        let h = build(&paths);
        let store = h.svc.create_log_store(true).unwrap();
        for _ in 0..30 {
            store.append_async(body(), 0, None).unwrap();
            h.svc.logdev().flush().unwrap();
        }
        store.truncate(24, true).unwrap();
        h.svc.device_truncate().unwrap().expect("boundary exists");
        for _ in 30..40 {
            store.append_async(body(), 0, None).unwrap();
            h.svc.logdev().flush().unwrap();
        }
        h.svc.shutdown().unwrap();
        h.mgr.close().unwrap();
    }

    let h = build(&paths);
    let store = h.svc.open_log_store(0, true).unwrap();
    let found: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let found2 = found.clone();
    store.register_log_found_cb(Arc::new(move |lsn, _| {
        found2.lock().push(lsn);
    }));
    h.svc.replay().unwrap();

    // Everything after the last device truncation survives, in order,
    // across the wrap point
    let lsns = found.lock();
    assert_eq!(*lsns, (25..40).collect::<Vec<i64>>());
    assert_eq!(store.truncated_upto(), 24);
    assert_eq!(store.seq_num(), 40);
    assert_eq!(store.read_sync(32).unwrap(), body());
}
