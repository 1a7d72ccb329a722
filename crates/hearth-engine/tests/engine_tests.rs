//! Engine-level scenarios: first boot, reattach, capacity accounting,
//! out-of-space behavior and failed-vdev handling.

use bytes::Bytes;
use hearth_common::{BlkAllocHints, BlkId, EngineConfig, Error, VdevKind};
use hearth_engine::Engine;
use std::path::PathBuf;
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

#[test]
fn first_boot_data_write_read_back() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 1 << 30);

    let engine = boot(&paths);
    assert!(engine.is_first_time_boot());

    let data = engine.data_store();
    let blkid = data
        .alloc_contiguous_blk(4096, &BlkAllocHints::default())
        .unwrap();
    let pattern = Bytes::from(vec![0xAB_u8; 4096]);
    data.write(blkid, &pattern).unwrap();

    let read = data.read(blkid).unwrap();
    assert_eq!(read, pattern);
    assert_eq!(engine.get_system_capacity().used_data_size, 4096);
}

#[test]
fn reattach_finds_every_store() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 32 << 20);

    let engine = boot(&paths);
    assert!(engine.is_first_time_boot());
    let cap = engine.get_system_capacity();
    assert!(cap.initial_total_size > 0);

    let engine = engine.restart().unwrap();
    assert!(!engine.is_first_time_boot());
    assert_eq!(engine.get_system_capacity().initial_total_size, cap.initial_total_size);
    // Recovery hooks are forwarded on reattach without complaint
    engine.data_recovery_done();
    engine.indx_recovery_done();
}

#[test]
fn capacity_shares_leave_data_dominant() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 32 << 20);
    let engine = boot(&paths);

    let total = engine.device_manager().total_capacity();
    let data_size = engine.data_store().size();
    assert!(data_size >= total * 85 / 100, "data store should get ~90%");
    assert!(data_size < total);
    assert!(engine.index_store().size() < data_size / 10);
}

#[test]
fn out_of_space_then_free_then_alloc() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 32 << 20);
    let engine = boot(&paths);
    let data = engine.data_store();

    let mut last = None;
    loop {
        match data.alloc_contiguous_blk(1 << 20, &BlkAllocHints::default()) {
            Ok(id) => last = Some(id),
            Err(Error::OutOfSpace) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let last = last.expect("at least one allocation should fit");

    // Freeing makes an allocation of the freed size succeed again
    data.free(last).unwrap();
    data.alloc_contiguous_blk(1 << 20, &BlkAllocHints::default())
        .unwrap();
}

#[test]
fn allocator_checkpoint_survives_restart() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 32 << 20);
    let engine = boot(&paths);

    let data = engine.data_store();
    for _ in 0..4 {
        data.alloc_contiguous_blk(64 << 10, &BlkAllocHints::default())
            .unwrap();
    }
    let used = engine.get_system_capacity().used_data_size;
    assert_eq!(used, 4 * (64 << 10));

    let cp = Engine::<()>::blkalloc_attach_prepare_cp(None);
    engine.blkalloc_cp_start(&cp).unwrap();

    let engine = engine.restart().unwrap();
    assert_eq!(engine.get_system_capacity().used_data_size, used);
    engine.data_recovery_done();
}

#[test]
fn failed_index_vdev_stops_reattach() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 32 << 20);

    let index_id = {
        let engine = boot(&paths);
        let mut index_id = None;
        engine
            .device_manager()
            .enumerate_vdevs(|record| {
                if record.kind_tag == 2 {
                    index_id = Some(record.id);
                }
                Ok(())
            })
            .unwrap();
        let index_id = index_id.expect("index vdev exists");
        engine.device_manager().mark_vdev_failed(index_id);
        assert_eq!(engine.failed_vdevs(), vec![index_id]);
        engine.shutdown().unwrap();
        index_id
    };

    let mut engine: Engine = Engine::init(EngineConfig::with_devices(paths.clone())).unwrap();
    match engine.init_devices() {
        Err(Error::VdevFailed(id)) => assert_eq!(id, index_id),
        other => panic!("expected VdevFailed, got {other:?}"),
    }
}

#[test]
fn deprecated_superblock_store_reattaches() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 32 << 20);

    {
        // Old media carried a superblock vdev; fabricate one
        let engine = boot(&paths);
        let context = VdevKind::Superblock {
            root: BlkId::new(0, 0, 1),
        }
        .encode();
        engine
            .device_manager()
            .register_vdev(1 << 20, 4096, 1, &context)
            .unwrap();
        engine.shutdown().unwrap();
    }

    let mut engine: Engine = Engine::init(EngineConfig::with_devices(paths.clone())).unwrap();
    engine.init_devices().unwrap();
    assert!(engine.sb_store().is_some());

    // Bootstrap allocation becomes the persisted boot record
    let root = engine.alloc_sb_blk(4096).unwrap();
    assert!(root.is_valid());

    let data = Bytes::from(vec![0x5C_u8; 4096]);
    engine.sb_store().unwrap().write(root, &data).unwrap();

    // One buffer per mirror so the caller can vote
    let copies = engine.read_sb_nmirror().unwrap();
    assert_eq!(copies.len(), 2);
    for copy in copies {
        assert_eq!(copy, data);
    }
}

#[test]
fn superblock_without_root_is_init_failed() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 2, 32 << 20);

    {
        let engine = boot(&paths);
        let context = VdevKind::Superblock {
            root: BlkId::INVALID,
        }
        .encode();
        engine
            .device_manager()
            .register_vdev(1 << 20, 4096, 1, &context)
            .unwrap();
        engine.shutdown().unwrap();
    }

    let mut engine: Engine = Engine::init(EngineConfig::with_devices(paths.clone())).unwrap();
    assert!(matches!(engine.init_devices(), Err(Error::InitFailed(_))));
}

#[test]
fn empty_device_list_is_rejected() {
    let err = Engine::<()>::init(EngineConfig::default()).err().unwrap();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn restricted_mode_refuses_blank_fleet() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);

    let mut cfg = EngineConfig::with_devices(paths);
    cfg.is_restricted_mode = true;
    let mut engine: Engine = Engine::init(cfg).unwrap();
    assert!(matches!(engine.init_devices(), Err(Error::InitFailed(_))));
}

#[test]
fn min_io_size_is_derived() {
    let dir = TempDir::new().unwrap();
    let paths = make_fleet(&dir, 1, 32 << 20);

    let mut cfg = EngineConfig::with_devices(paths);
    cfg.min_virtual_page_size = 8192;
    let engine: Engine = Engine::init(cfg).unwrap();
    // Clamped to the atomic physical page size
    assert_eq!(engine.min_io_size(), 4096);
}
