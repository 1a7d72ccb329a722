//! Hearth Engine - the facade binding every subsystem
//!
//! One [`Engine`] instance owns the device manager, the shared block
//! cache, the five typed block stores and the log-store service. On
//! first boot it carves the fleet into vdevs with their default sizing;
//! on reattach it replays vdev-found events and dispatches each to the
//! matching typed constructor via the decoded context blob.
//!
//! There is no process-global state: restarting is dropping the engine
//! handle and constructing a new one over the same devices.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hearth_common::{
    round_up, BlkAllocHints, BlkId, CapacityAttrs, DriveAttributes, EngineConfig, Error, Result,
    VdevId, VdevKind,
};
use hearth_logstore::{LogDev, LogDevConfig, LogStoreService};
use hearth_storage::{
    BlkAllocCp, BlkStore, BlockCache, CacheMode, CompletionCb, DeviceManager, IndexBlkStore,
    IndexBuffer, MetaBlkMgr, MetaCookie, ResourceMgr, Vdev, VdevRecord,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Default first-boot capacity shares, in percent
const DATA_SHARE: u64 = 90;
const INDEX_SHARE: u64 = 2;
const LOGDEV_SHARE: u64 = 1;
const META_SHARE: u64 = 1;

/// Meta-block name of the persisted allocator checkpoint
const BLKALLOC_META_NAME: &str = "blkalloc";

type RecoveredBlobs = Arc<Mutex<HashMap<&'static str, (Bytes, MetaCookie)>>>;

/// The engine facade
pub struct Engine<B: IndexBuffer = ()> {
    cfg: EngineConfig,
    attrs: DriveAttributes,
    min_io_size: u32,
    data_pagesz: u32,

    resource: Arc<ResourceMgr>,
    cache: Option<Arc<BlockCache>>,
    dev_mgr: Option<Arc<DeviceManager>>,
    meta_mgr: Arc<MetaBlkMgr>,

    data_store: Option<Arc<BlkStore>>,
    index_store: Option<Arc<IndexBlkStore<B>>>,
    sb_store: Option<Arc<BlkStore>>,
    sb_root: BlkId,
    logdev_store: Option<Arc<BlkStore>>,
    meta_store: Option<Arc<BlkStore>>,
    log_service: Option<Arc<LogStoreService>>,

    data_completion_cb: Option<CompletionCb>,
    recovered: RecoveredBlobs,
    failed_vdevs: Arc<Mutex<Vec<VdevId>>>,
    blkalloc_cookie: Mutex<Option<MetaCookie>>,
    first_time_boot: bool,
    size_avail: u64,
    shut: AtomicBool,
}

impl<B: IndexBuffer> Engine<B> {
    /// Validate the configuration and set up the in-memory skeleton.
    /// Nothing touches the devices until [`Engine::init_devices`].
    pub fn init(cfg: EngineConfig) -> Result<Self> {
        if cfg.devices.is_empty() {
            return Err(Error::invalid_argument("null device list"));
        }

        let attrs = cfg.drive_attr.unwrap_or_default();
        let min_io_size = cfg.min_virtual_page_size.min(attrs.atomic_phys_page_size);

        info!(
            devices = cfg.devices.len(),
            min_io_size, "engine starting"
        );

        Ok(Self {
            attrs,
            min_io_size,
            data_pagesz: cfg.min_virtual_page_size,
            resource: Arc::new(ResourceMgr::new()),
            cache: None,
            dev_mgr: None,
            meta_mgr: Arc::new(MetaBlkMgr::new()),
            data_store: None,
            index_store: None,
            sb_store: None,
            sb_root: BlkId::INVALID,
            logdev_store: None,
            meta_store: None,
            log_service: None,
            data_completion_cb: None,
            recovered: Arc::new(Mutex::new(HashMap::new())),
            failed_vdevs: Arc::new(Mutex::new(Vec::new())),
            blkalloc_cookie: Mutex::new(None),
            first_time_boot: false,
            size_avail: 0,
            cfg,
            shut: AtomicBool::new(false),
        })
    }

    /// Install the data store's per-I/O completion hook. Must happen
    /// before [`Engine::init_devices`].
    pub fn set_data_completion_cb(&mut self, cb: CompletionCb) {
        self.data_completion_cb = Some(cb);
    }

    /// Attach the devices: format the fleet and create every vdev on
    /// first boot, or rediscover and dispatch persisted vdevs on
    /// reattach.
    pub fn init_devices(&mut self) -> Result<()> {
        let mut mgr = DeviceManager::new(self.attrs, self.cfg.device_type);
        // Restricted mode never formats a blank fleet
        let first_boot = mgr.add_devices(&self.cfg.devices, !self.cfg.is_restricted_mode)?;
        let mgr = Arc::new(mgr);
        self.first_time_boot = first_boot;

        let failed = self.failed_vdevs.clone();
        mgr.set_error_hook(Arc::new(move |vdev| {
            failed.lock().push(vdev);
        }));

        self.resource.set_total_cap(mgr.total_capacity());
        self.cache = Some(Arc::new(BlockCache::new(self.resource.cache_size() as usize)));
        self.dev_mgr = Some(mgr.clone());

        self.register_meta_handlers();

        if first_boot {
            self.create_data_blkstore(None)?;
            self.create_index_blkstore(None)?;
            self.create_logdev_blkstore(None)?;
            self.create_meta_blkstore(None)?;
        } else {
            let mut records = Vec::new();
            mgr.enumerate_vdevs(|record| {
                records.push(record.clone());
                Ok(())
            })?;
            for record in &records {
                self.dispatch_vdev(record)?;
            }
            if self.cfg.auto_recovery {
                self.restore_allocators();
            }
        }

        self.start_log_service()?;
        info!(first_boot, "engine devices initialized");
        Ok(())
    }

    fn register_meta_handlers(&self) {
        for name in [
            hearth_logstore::logdev::LOGDEV_META_NAME,
            hearth_logstore::service::LOGSTORE_META_NAME,
            BLKALLOC_META_NAME,
        ] {
            let recovered = self.recovered.clone();
            self.meta_mgr.register_handler(
                name,
                Arc::new(move |blob, cookie| {
                    recovered.lock().insert(name, (blob, cookie));
                }),
                None,
            );
        }
    }

    /// The single dispatch site turning a persisted vdev record into the
    /// matching typed store
    fn dispatch_vdev(&mut self, record: &VdevRecord) -> Result<()> {
        let kind = VdevKind::decode(&record.context)?;
        if record.failed {
            warn!(vdev = record.id, %kind, "vdev is in failed state");
            return Err(Error::VdevFailed(record.id));
        }
        match kind {
            VdevKind::Data => self.create_data_blkstore(Some(record)),
            VdevKind::Index => self.create_index_blkstore(Some(record)),
            VdevKind::Superblock { root } => self.create_sb_blkstore(record, root),
            VdevKind::LogDev => self.create_logdev_blkstore(Some(record)),
            VdevKind::Meta => self.create_meta_blkstore(Some(record)),
        }
    }

    fn mgr(&self) -> &Arc<DeviceManager> {
        self.dev_mgr.as_ref().expect("init_devices not called")
    }

    fn cache_ref(&self) -> Arc<BlockCache> {
        self.cache.clone().expect("init_devices not called")
    }

    fn share_size(&self, percent: u64) -> u64 {
        round_up(
            self.mgr().total_capacity() * percent / 100,
            u64::from(self.attrs.phys_page_size),
        )
    }

    fn make_vdev(&self, record: Option<&VdevRecord>, size: u64, page_size: u32, mirrors: u8, kind: &VdevKind) -> Result<Vdev> {
        let record = match record {
            Some(record) => record.clone(),
            None => self
                .mgr()
                .register_vdev(size, page_size, mirrors, &kind.encode())?,
        };
        Ok(Vdev::new(self.mgr().clone(), &record))
    }

    fn create_data_blkstore(&mut self, record: Option<&VdevRecord>) -> Result<()> {
        let size = self.share_size(DATA_SHARE);
        let vdev = self.make_vdev(record, size, self.data_pagesz, 0, &VdevKind::Data)?;
        if record.is_none() {
            self.size_avail = size;
            info!(size, "maximum capacity for data blocks");
        } else {
            self.size_avail = vdev.available_size();
        }
        self.data_store = Some(Arc::new(BlkStore::new(
            "data",
            vdev,
            self.cache_ref(),
            CacheMode::Writeback,
            self.data_completion_cb.clone(),
        )));
        Ok(())
    }

    fn create_index_blkstore(&mut self, record: Option<&VdevRecord>) -> Result<()> {
        let size = self.share_size(INDEX_SHARE);
        let vdev = self.make_vdev(
            record,
            size,
            self.attrs.atomic_phys_page_size,
            0,
            &VdevKind::Index,
        )?;
        self.index_store = Some(Arc::new(IndexBlkStore::new(BlkStore::new(
            "index",
            vdev,
            self.cache_ref(),
            CacheMode::ReadModifyWriteback,
            None,
        ))));
        Ok(())
    }

    /// Deprecated superblock store: reattach-only, never created on a
    /// fresh first boot
    fn create_sb_blkstore(&mut self, record: &VdevRecord, root: BlkId) -> Result<()> {
        let vdev = Vdev::new(self.mgr().clone(), record);
        let store = BlkStore::new("superblock", vdev, self.cache_ref(), CacheMode::PassThru, None);
        if !root.is_valid() {
            warn!("superblock root missing; init was aborted previously");
            return Err(Error::InitFailed(
                "previous init left no superblock root; retry with re-init".into(),
            ));
        }
        self.sb_root = root;
        self.sb_store = Some(Arc::new(store));
        Ok(())
    }

    fn create_logdev_blkstore(&mut self, record: Option<&VdevRecord>) -> Result<()> {
        let size = self.share_size(LOGDEV_SHARE);
        let vdev = self.make_vdev(
            record,
            size,
            self.attrs.atomic_phys_page_size,
            0,
            &VdevKind::LogDev,
        )?;
        self.logdev_store = Some(Arc::new(BlkStore::new(
            "logdev",
            vdev,
            self.cache_ref(),
            CacheMode::PassThru,
            None,
        )));
        Ok(())
    }

    fn create_meta_blkstore(&mut self, record: Option<&VdevRecord>) -> Result<()> {
        let size = self.share_size(META_SHARE);
        let vdev = self.make_vdev(
            record,
            size,
            self.attrs.atomic_phys_page_size,
            0,
            &VdevKind::Meta,
        )?;
        let store = Arc::new(BlkStore::new(
            "meta",
            vdev,
            self.cache_ref(),
            CacheMode::PassThru,
            None,
        ));
        self.meta_mgr.start(store.clone(), record.is_none())?;
        self.meta_store = Some(store);
        Ok(())
    }

    fn start_log_service(&mut self) -> Result<()> {
        let logdev_store = self
            .logdev_store
            .clone()
            .ok_or_else(|| Error::corrupt("no logdev vdev found"))?;
        if self.meta_store.is_none() {
            return Err(Error::corrupt("no meta vdev found"));
        }

        let mut recovered = self.recovered.lock();
        let logdev_sb = recovered.remove(hearth_logstore::logdev::LOGDEV_META_NAME);
        let registry = recovered.remove(hearth_logstore::service::LOGSTORE_META_NAME);
        drop(recovered);

        let logdev = LogDev::new(
            logdev_store,
            self.meta_mgr.clone(),
            LogDevConfig::default(),
            logdev_sb,
        )?;
        self.log_service = Some(LogStoreService::new(
            logdev,
            self.meta_mgr.clone(),
            registry,
        )?);
        Ok(())
    }

    fn restore_allocators(&self) {
        let Some((blob, cookie)) = self.recovered.lock().remove(BLKALLOC_META_NAME) else {
            return;
        };
        *self.blkalloc_cookie.lock() = Some(cookie);

        let snapshots = match decode_blkalloc(&blob) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!("allocator checkpoint unreadable, falling back to recovery: {e}");
                return;
            }
        };
        for (vdev_id, state) in snapshots {
            if let Some(store) = &self.data_store {
                if store.vdev_id() == vdev_id {
                    store.vdev().restore_allocator(&state);
                    continue;
                }
            }
            if let Some(store) = &self.index_store {
                if store.vdev_id() == vdev_id {
                    store.vdev().restore_allocator(&state);
                }
            }
        }
    }

    /// Whether `init_devices` formatted a fresh fleet
    pub fn is_first_time_boot(&self) -> bool {
        self.first_time_boot
    }

    /// The data block store
    pub fn data_store(&self) -> &Arc<BlkStore> {
        self.data_store.as_ref().expect("init_devices not called")
    }

    /// The index block store
    pub fn index_store(&self) -> &Arc<IndexBlkStore<B>> {
        self.index_store.as_ref().expect("init_devices not called")
    }

    /// The deprecated superblock store, present only on old media
    pub fn sb_store(&self) -> Option<&Arc<BlkStore>> {
        self.sb_store.as_ref()
    }

    /// The log-store service
    pub fn log_service(&self) -> &Arc<LogStoreService> {
        self.log_service.as_ref().expect("init_devices not called")
    }

    /// The meta-block manager
    pub fn meta_mgr(&self) -> &Arc<MetaBlkMgr> {
        &self.meta_mgr
    }

    /// The device manager
    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        self.mgr()
    }

    /// The shared block cache
    pub fn cache(&self) -> &Arc<BlockCache> {
        self.cache.as_ref().expect("init_devices not called")
    }

    /// Process-wide resource knobs
    pub fn resource_mgr(&self) -> &Arc<ResourceMgr> {
        &self.resource
    }

    /// Derived smallest I/O unit
    pub fn min_io_size(&self) -> u32 {
        self.min_io_size
    }

    /// Bytes still allocatable from the data store
    pub fn available_size(&self) -> u64 {
        self.size_avail
    }

    /// Vdevs poisoned by device errors since start-up
    pub fn failed_vdevs(&self) -> Vec<VdevId> {
        self.failed_vdevs.lock().clone()
    }

    /// Capacity snapshot across the data and index stores
    pub fn get_system_capacity(&self) -> CapacityAttrs {
        let used_data_size = self.data_store.as_ref().map_or(0, |s| s.used_size());
        let used_index_size = self.index_store.as_ref().map_or(0, |s| s.used_size());
        let initial_total_size = self.data_store.as_ref().map_or(0, |s| s.size())
            + self.index_store.as_ref().map_or(0, |s| s.size());
        CapacityAttrs {
            used_data_size,
            used_index_size,
            used_total_size: used_data_size + used_index_size,
            initial_total_size,
        }
    }

    /// Contiguous bootstrap allocation from the superblock store; the
    /// allocated block becomes the persisted application boot record.
    pub fn alloc_sb_blk(&mut self, size: u64) -> Result<BlkId> {
        let store = self
            .sb_store
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("no superblock store on this fleet"))?;
        let hints = BlkAllocHints {
            contiguous: true,
            ..Default::default()
        };
        let blkid = store.alloc_contiguous_blk(size, &hints)?;
        store.update_vb_context(&VdevKind::Superblock { root: blkid }.encode())?;
        self.sb_root = blkid;
        Ok(blkid)
    }

    /// Vote-read the application boot record from every mirror
    pub fn read_sb_nmirror(&self) -> Result<Vec<Bytes>> {
        let store = self
            .sb_store
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("no superblock store on this fleet"))?;
        store.read_nmirror(self.sb_root, store.vdev().mirrors())
    }

    /// Forwarded to the data store after its owner reconciled
    /// outstanding operations; meaningful on reattach only
    pub fn data_recovery_done(&self) {
        if !self.first_time_boot {
            self.data_store().recovery_done();
        }
    }

    /// Forwarded to the index store; meaningful on reattach only
    pub fn indx_recovery_done(&self) {
        if !self.first_time_boot {
            self.index_store().recovery_done();
        }
    }

    /// Prepare the next allocator checkpoint handle
    pub fn blkalloc_attach_prepare_cp(cur: Option<&Arc<BlkAllocCp>>) -> Arc<BlkAllocCp> {
        BlkStore::attach_prepare_cp(cur)
    }

    /// Seal the current allocator checkpoint across the data and index
    /// stores and persist it through the meta-block manager
    pub fn blkalloc_cp_start(&self, cp: &Arc<BlkAllocCp>) -> Result<()> {
        self.data_store().blkalloc_cp_start(cp);
        self.index_store().blkalloc_cp_start(cp);

        let blob = encode_blkalloc(&cp.take_snapshots());
        let mut cookie = self.blkalloc_cookie.lock();
        match *cookie {
            Some(c) => self.meta_mgr.update_meta_blk(c, blob),
            None => {
                *cookie = Some(self.meta_mgr.write_meta_blk(BLKALLOC_META_NAME, blob)?);
                Ok(())
            }
        }
    }

    /// Quiesce issued I/O and close the fleet
    pub fn shutdown(&self) -> Result<()> {
        if self.shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(service) = &self.log_service {
            service.shutdown()?;
        }
        if let Some(mgr) = &self.dev_mgr {
            mgr.close()?;
        }
        info!("engine shut down");
        Ok(())
    }

    /// Restart over the same devices: the test analog of a reboot.
    /// Every piece of engine state is dropped and rebuilt from media.
    pub fn restart(self) -> Result<Engine<B>> {
        self.shutdown()?;
        let cfg = self.cfg.clone();
        drop(self);
        let mut engine = Engine::init(cfg)?;
        engine.init_devices()?;
        Ok(engine)
    }
}

impl<B: IndexBuffer> Drop for Engine<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("shutdown on drop failed: {e}");
        }
    }
}

fn encode_blkalloc(snapshots: &[(VdevId, Vec<u8>)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(snapshots.len() as u32);
    for (vdev, state) in snapshots {
        buf.put_u32_le(*vdev);
        buf.put_u32_le(state.len() as u32);
        buf.put_slice(state);
    }
    buf.freeze()
}

fn decode_blkalloc(data: &[u8]) -> Result<Vec<(VdevId, Vec<u8>)>> {
    let mut buf = data;
    if buf.len() < 4 {
        return Err(Error::corrupt("allocator checkpoint too small"));
    }
    let count = buf.get_u32_le() as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() < 8 {
            return Err(Error::corrupt("allocator checkpoint truncated"));
        }
        let vdev = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if buf.len() < len {
            return Err(Error::corrupt("allocator checkpoint truncated"));
        }
        out.push((vdev, buf[..len].to_vec()));
        buf.advance(len);
    }
    Ok(out)
}
