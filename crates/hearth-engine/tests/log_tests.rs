//! Log-service scenarios: append/flush/replay round trips, gap
//! filling, cross-store truncation safety, rollback and torn-batch
//! crash recovery.

use bytes::Bytes;
use hearth_common::{EngineConfig, Error};
use hearth_engine::Engine;
use hearth_logstore::Lsn;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn make_fleet(dir: &TempDir, count: usize, size: u64) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.path().join(format!("dev{i}"));
            let file = std::fs::File::create(&path).unwrap();
            file.set_len(size).unwrap();
            path
        })
        .collect()
}

fn boot(paths: &[PathBuf]) -> Engine {
    let mut engine: Engine = Engine::init(EngineConfig::with_devices(paths.to_vec())).unwrap();
    engine.init_devices().unwrap();
    engine
}

fn payload(byte: u8, len: usize) -> Bytes {
    Bytes::from(vec![byte; len])
}

#[test]
fn append_flush_replay_round_trip() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 32 << 20);

    let bufs: Vec<Bytes> = (0..3).map(|i| payload(i + 1, 100)).collect();
    let engine = boot(&paths);
    {
        let store = engine.log_service().create_log_store(true).unwrap();
        assert_eq!(store.truncated_upto(), -1);
        for (i, buf) in bufs.iter().enumerate() {
            let lsn = store.append_async(buf.clone(), 0, None).unwrap();
            assert_eq!(lsn, i as Lsn);
        }
        store.flush_sync(None).unwrap();
        assert_eq!(store.get_contiguous_completed_seq_num(-1), 2);
    }

    let engine = engine.restart().unwrap();
    let store = engine.log_service().open_log_store(0, true).unwrap();

    let found: Arc<Mutex<Vec<(Lsn, Bytes)>>> = Arc::new(Mutex::new(Vec::new()));
    let found2 = found.clone();
    store.register_log_found_cb(Arc::new(move |lsn, buf| {
        found2.lock().push((lsn, buf));
    }));
    let done = Arc::new(AtomicUsize::new(0));
    let done2 = done.clone();
    store.register_log_replay_done_cb(Arc::new(move || {
        done2.fetch_add(1, Ordering::SeqCst);
    }));

    engine.log_service().replay().unwrap();

    let found = found.lock();
    assert_eq!(found.len(), 3);
    for (i, buf) in bufs.iter().enumerate() {
        assert_eq!(found[i], (i as Lsn, buf.clone()));
    }
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(store.seq_num(), 3);

    // Replayed records read back through the device
    assert_eq!(store.read_sync(1).unwrap(), bufs[1]);
}

#[test]
fn completed_append_reads_back_submitted_buffer() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);
    let engine = boot(&paths);
    let store = engine.log_service().create_log_store(true).unwrap();

    let completions: Arc<Mutex<Vec<Lsn>>> = Arc::new(Mutex::new(Vec::new()));
    let completions2 = completions.clone();
    store.register_req_comp_cb(Arc::new(move |lsn, ld_key, _| {
        assert!(ld_key.is_valid());
        completions2.lock().push(lsn);
    }));

    let bufs: Vec<Bytes> = (0..5).map(|i| payload(0x10 + i, 64 + i as usize)).collect();
    for buf in &bufs {
        store.append_async(buf.clone(), 0, None).unwrap();
    }
    store.flush_sync(None).unwrap();

    // Completions arrive in lsn order
    assert_eq!(*completions.lock(), vec![0, 1, 2, 3, 4]);
    for (lsn, buf) in bufs.iter().enumerate() {
        assert_eq!(&store.read_sync(lsn as Lsn).unwrap(), buf);
    }
}

#[test]
fn gap_fill_advances_watermark() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);
    let engine = boot(&paths);
    let store = engine.log_service().create_log_store(false).unwrap();

    for lsn in [0, 1, 3, 4] {
        store.write_sync(lsn, payload(lsn as u8, 32)).unwrap();
    }
    assert_eq!(store.get_contiguous_completed_seq_num(-1), 1);

    store.fill_gap(2).unwrap();
    assert_eq!(store.get_contiguous_completed_seq_num(-1), 4);

    // A gap-filled lsn is not readable
    assert!(matches!(store.read_sync(2), Err(Error::OutOfRange(_))));
    // And cannot be gap-filled or rewritten once occupied
    assert!(store.fill_gap(1).is_err());
    assert!(store.write_async(1, payload(9, 8), 0, None).is_err());
}

#[test]
fn truncation_safety_across_stores() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 64 << 20);
    let engine = boot(&paths);
    let svc = engine.log_service();

    let s2 = svc.create_log_store(true).unwrap();
    let s1 = svc.create_log_store(true).unwrap();

    let body = payload(0x77, 128);
    for _ in 0..=50 {
        s2.append_async(body.clone(), 0, None).unwrap();
    }
    s2.flush_sync(None).unwrap();
    for _ in 51..=60 {
        s2.append_async(body.clone(), 0, None).unwrap();
    }
    s2.flush_sync(None).unwrap();
    for _ in 0..=100 {
        s1.append_async(body.clone(), 0, None).unwrap();
    }
    s1.flush_sync(None).unwrap();

    // S1 releases everything; S2 only its first 51 records. The global
    // round must take S2's (older) boundary, not S1's.
    s1.truncate(100, true).unwrap();
    s2.truncate(50, true).unwrap();
    let r1 = svc.device_truncate().unwrap().expect("a boundary exists");

    assert!(matches!(s2.read_sync(50), Err(Error::OutOfRange(_))));
    assert_eq!(s2.read_sync(51).unwrap(), body);
    assert_eq!(s2.read_sync(60).unwrap(), body);

    // S2 advances; the next round truncates to S2's new boundary,
    // still below S1's.
    s2.truncate(60, true).unwrap();
    let r2 = svc.device_truncate().unwrap().expect("a boundary exists");
    assert!(r2 > r1, "second round must reclaim strictly more");
}

#[test]
fn truncate_is_idempotent_and_bounded() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);
    let engine = boot(&paths);
    let store = engine.log_service().create_log_store(true).unwrap();

    for i in 0..5 {
        store.append_async(payload(i, 16), 0, None).unwrap();
    }
    store.flush_sync(None).unwrap();

    store.truncate(3, true).unwrap();
    assert_eq!(store.truncated_upto(), 3);
    // Truncating to an older point is a no-op
    store.truncate(1, true).unwrap();
    assert_eq!(store.truncated_upto(), 3);
    // Truncating past the highest completed lsn is forbidden
    assert!(store.truncate(7, true).is_err());

    assert!(matches!(store.read_sync(3), Err(Error::OutOfRange(_))));
    assert_eq!(store.read_sync(4).unwrap(), payload(4, 16));
}

#[test]
fn foreach_iterates_completed_tail() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);
    let engine = boot(&paths);
    let store = engine.log_service().create_log_store(true).unwrap();

    for i in 0..5 {
        store.append_async(payload(i, 16), 0, None).unwrap();
    }
    store.flush_sync(None).unwrap();
    store.truncate(1, true).unwrap();

    let mut seen = Vec::new();
    store
        .foreach(0, |lsn, buf| {
            seen.push((lsn, buf));
            true
        })
        .unwrap();
    assert_eq!(
        seen.iter().map(|(lsn, _)| *lsn).collect::<Vec<_>>(),
        vec![2, 3, 4]
    );

    // Early stop
    let mut count = 0;
    store
        .foreach(0, |_, _| {
            count += 1;
            false
        })
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn rollback_rewinds_and_survives_restart() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);

    let engine = boot(&paths);
    {
        let svc = engine.log_service();
        let store = svc.create_log_store(true).unwrap();
        for i in 0..5 {
            store.append_async(payload(i, 32), 0, None).unwrap();
        }
        store.flush_sync(None).unwrap();

        // Beyond seq_num is rejected
        assert!(store.rollback_async(10, None).is_err());

        let rolled: Arc<Mutex<Vec<Lsn>>> = Arc::new(Mutex::new(Vec::new()));
        let rolled2 = rolled.clone();
        let dropped = store
            .rollback_async(2, Some(Arc::new(move |lsn| rolled2.lock().push(lsn))))
            .unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(store.seq_num(), 3);

        // The marker becomes durable with the next flush
        svc.logdev().flush().unwrap();
        assert_eq!(*rolled.lock(), vec![2]);

        assert!(store.read_sync(3).is_err());
        // The stream continues from the rollback point
        let lsn = store.append_async(payload(0xEE, 32), 0, None).unwrap();
        assert_eq!(lsn, 3);
        store.flush_sync(None).unwrap();
    }

    let engine = engine.restart().unwrap();
    let store = engine.log_service().open_log_store(0, true).unwrap();
    let found: Arc<Mutex<Vec<(Lsn, Bytes)>>> = Arc::new(Mutex::new(Vec::new()));
    let found2 = found.clone();
    store.register_log_found_cb(Arc::new(move |lsn, buf| {
        found2.lock().push((lsn, buf));
    }));
    engine.log_service().replay().unwrap();

    let found = found.lock();
    let lsns: Vec<Lsn> = found.iter().map(|(lsn, _)| *lsn).collect();
    assert_eq!(lsns, vec![0, 1, 2, 3]);
    // Lsn 3 is the post-rollback record, not the discarded one
    assert_eq!(found[3].1, payload(0xEE, 32));
    assert_eq!(store.seq_num(), 4);
}

#[test]
fn torn_trailing_batch_is_dropped_on_replay() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);

    let logdev_offset = {
        let engine = boot(&paths);
        let store = engine.log_service().create_log_store(true).unwrap();
        // One record per batch: append_sync flushes each time
        for i in 0..3 {
            store.append_sync(payload(0xA0 + i, 48)).unwrap();
        }

        let mut offset = None;
        engine
            .device_manager()
            .enumerate_vdevs(|record| {
                if record.kind_tag == 4 {
                    offset = Some(record.start_offset);
                }
                Ok(())
            })
            .unwrap();
        engine.shutdown().unwrap();
        offset.expect("logdev vdev exists")
    };

    // Scribble over the third batch, as if the crash tore it mid-write
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&paths[0])
            .unwrap();
        file.seek(SeekFrom::Start(logdev_offset + 2 * 4096 + 8)).unwrap();
        file.write_all(&[0xFF; 64]).unwrap();
        file.sync_all().unwrap();
    }

    let engine = boot(&paths);
    let store = engine.log_service().open_log_store(0, true).unwrap();
    let found: Arc<Mutex<Vec<Lsn>>> = Arc::new(Mutex::new(Vec::new()));
    let found2 = found.clone();
    store.register_log_found_cb(Arc::new(move |lsn, _| {
        found2.lock().push(lsn);
    }));
    engine.log_service().replay().unwrap();

    // The durable prefix survives; the torn tail is absent and the
    // absence is contiguous from the tail
    assert_eq!(*found.lock(), vec![0, 1]);
    assert_eq!(store.seq_num(), 2);
    assert!(store.read_sync(2).is_err());
    assert_eq!(store.read_sync(1).unwrap(), payload(0xA1, 48));
}

#[test]
fn two_streams_are_independent() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);
    let engine = boot(&paths);
    let svc = engine.log_service();

    let a = svc.create_log_store(true).unwrap();
    let b = svc.create_log_store(true).unwrap();
    assert_ne!(a.store_id(), b.store_id());

    let lsn_a = a.append_sync(payload(1, 16)).unwrap();
    let lsn_b = b.append_sync(payload(2, 16)).unwrap();
    assert_eq!(lsn_a, 0);
    assert_eq!(lsn_b, 0);

    assert_eq!(a.read_sync(0).unwrap(), payload(1, 16));
    assert_eq!(b.read_sync(0).unwrap(), payload(2, 16));
    assert_eq!(svc.store_ids(), vec![a.store_id(), b.store_id()]);
}

#[test]
fn removed_store_is_forgotten() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);

    let engine = boot(&paths);
    {
        let svc = engine.log_service();
        let store = svc.create_log_store(true).unwrap();
        store.append_sync(payload(5, 16)).unwrap();
        svc.remove_log_store(store.store_id()).unwrap();
        assert!(svc.remove_log_store(99).is_err());
    }

    let engine = engine.restart().unwrap();
    assert!(engine.log_service().store_ids().is_empty());
    assert!(engine.log_service().open_log_store(0, true).is_err());
}
