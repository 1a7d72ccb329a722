//! Typed block stores
//!
//! A block store is the typed facade over one vdev: it owns the vdev
//! handle, applies the store's caching mode, and reports completions
//! through a per-store hook. The index store additionally attaches
//! typed buffers to cached blocks for the index layer.

use crate::cache::{BlockCache, CacheKey};
use crate::vdev::Vdev;
use bytes::{Bytes, BytesMut};
use hearth_common::{BlkAllocHints, BlkId, Error, Result, VdevId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Caching behavior of one block store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Bypass the cache entirely
    PassThru,
    /// Insert on write, invalidate on free
    Writeback,
    /// As `Writeback`, and merge sub-extent updates read-modify-write
    ReadModifyWriteback,
}

/// Kind of I/O reported to the completion hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Free,
}

/// Per-store I/O completion hook
pub type CompletionCb = Arc<dyn Fn(VdevId, BlkId, IoKind) + Send + Sync>;

/// One sealed allocator checkpoint across participating stores.
///
/// Two-phase: `attach_prepare_cp` produces the next handle, then
/// `blkalloc_cp_start` seals each store's bitmap snapshot into the
/// current one. The engine persists the collected snapshots.
pub struct BlkAllocCp {
    id: u64,
    snapshots: Mutex<Vec<(VdevId, Vec<u8>)>>,
}

impl BlkAllocCp {
    /// Checkpoint sequence number
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drain the sealed snapshots for persistence
    pub fn take_snapshots(&self) -> Vec<(VdevId, Vec<u8>)> {
        std::mem::take(&mut self.snapshots.lock())
    }
}

/// Typed facade over one vdev
pub struct BlkStore {
    name: String,
    vdev: Vdev,
    cache: Arc<BlockCache>,
    mode: CacheMode,
    comp_cb: Option<CompletionCb>,
}

impl BlkStore {
    /// Build a store over its (exclusively owned) vdev
    pub fn new(
        name: impl Into<String>,
        vdev: Vdev,
        cache: Arc<BlockCache>,
        mode: CacheMode,
        comp_cb: Option<CompletionCb>,
    ) -> Self {
        let name = name.into();
        info!(store = %name, vdev = vdev.id(), ?mode, "block store ready");
        Self {
            name,
            vdev,
            cache,
            mode,
            comp_cb,
        }
    }

    /// Store name (for diagnostics)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier of the underlying vdev
    pub fn vdev_id(&self) -> VdevId {
        self.vdev.id()
    }

    /// Page size of the underlying vdev
    pub fn page_size(&self) -> u32 {
        self.vdev.page_size()
    }

    /// Pages per chunk of the underlying vdev
    pub fn pages_per_chunk(&self) -> u32 {
        self.vdev.pages_per_chunk()
    }

    /// Number of chunks of the underlying vdev
    pub fn num_chunks(&self) -> u32 {
        self.vdev.num_chunks()
    }

    /// Total store capacity in bytes
    pub fn size(&self) -> u64 {
        self.vdev.size()
    }

    /// Bytes currently allocated
    pub fn used_size(&self) -> u64 {
        self.vdev.used_size()
    }

    /// Bytes still allocatable
    pub fn available_size(&self) -> u64 {
        self.vdev.available_size()
    }

    fn cache_key(&self, blkid: BlkId) -> CacheKey {
        CacheKey::new(self.vdev.id(), blkid)
    }

    fn complete(&self, blkid: BlkId, kind: IoKind) {
        if let Some(cb) = &self.comp_cb {
            cb(self.vdev.id(), blkid, kind);
        }
    }

    /// Allocate a contiguous run of pages covering `size` bytes
    pub fn alloc_contiguous_blk(&self, size: u64, hints: &BlkAllocHints) -> Result<BlkId> {
        let npages = size.div_ceil(u64::from(self.page_size())) as u32;
        self.vdev.alloc_contiguous(npages, hints)
    }

    /// Write a buffer to an allocated block
    pub fn write(&self, blkid: BlkId, data: &Bytes) -> Result<()> {
        match self.mode {
            CacheMode::PassThru => {
                self.vdev.write(blkid, data)?;
            }
            CacheMode::Writeback => {
                self.vdev.write(blkid, data)?;
                self.cache.insert(self.cache_key(blkid), data.clone());
            }
            CacheMode::ReadModifyWriteback => {
                let extent = blkid.nblks as usize * self.page_size() as usize;
                let merged = if data.len() < extent {
                    // Sub-extent update: merge over the current content
                    let current = match self.cache.get(&self.cache_key(blkid)) {
                        Some(buf) => buf,
                        None => self.vdev.read(blkid)?,
                    };
                    let mut buf = BytesMut::from(&current[..]);
                    buf.resize(extent, 0);
                    buf[..data.len()].copy_from_slice(data);
                    buf.freeze()
                } else {
                    data.clone()
                };
                self.vdev.write(blkid, &merged)?;
                self.cache.insert(self.cache_key(blkid), merged);
            }
        }
        self.complete(blkid, IoKind::Write);
        Ok(())
    }

    /// Read the full extent of a block
    pub fn read(&self, blkid: BlkId) -> Result<Bytes> {
        let data = if self.mode == CacheMode::PassThru {
            self.vdev.read(blkid)?
        } else {
            match self.cache.get(&self.cache_key(blkid)) {
                Some(buf) => buf,
                None => {
                    let buf = self.vdev.read(blkid)?;
                    self.cache.insert(self.cache_key(blkid), buf.clone());
                    buf
                }
            }
        };
        self.complete(blkid, IoKind::Read);
        Ok(data)
    }

    /// Read one buffer per mirror so the caller can vote
    pub fn read_nmirror(&self, blkid: BlkId, nmirrors: u8) -> Result<Vec<Bytes>> {
        let mut bufs = Vec::with_capacity(usize::from(nmirrors) + 1);
        for mirror in 0..=nmirrors {
            bufs.push(self.vdev.read_mirror(blkid, mirror)?);
        }
        Ok(bufs)
    }

    /// Free an allocated block
    pub fn free(&self, blkid: BlkId) -> Result<()> {
        self.vdev.free(blkid)?;
        if self.mode != CacheMode::PassThru {
            self.cache.invalidate(&self.cache_key(blkid));
        }
        self.complete(blkid, IoKind::Free);
        Ok(())
    }

    /// Sync the underlying devices
    pub fn sync(&self) -> Result<()> {
        self.vdev.sync()
    }

    /// Atomically rewrite the vdev's persisted context blob
    pub fn update_vb_context(&self, blob: &[u8]) -> Result<()> {
        self.vdev.update_context(blob)
    }

    /// Access to the underlying vdev (allocator state, failure flag)
    pub fn vdev(&self) -> &Vdev {
        &self.vdev
    }

    /// Mark the allocator's on-disk state as consistent after the owner
    /// reconciled outstanding operations. Called once per boot.
    pub fn recovery_done(&self) {
        self.vdev.recovery_done();
        info!(store = %self.name, "recovery done");
    }

    /// Prepare the next allocator checkpoint handle
    pub fn attach_prepare_cp(cur: Option<&Arc<BlkAllocCp>>) -> Arc<BlkAllocCp> {
        Arc::new(BlkAllocCp {
            id: cur.map_or(0, |cp| cp.id + 1),
            snapshots: Mutex::new(Vec::new()),
        })
    }

    /// Seal this store's allocator state into the current checkpoint
    pub fn blkalloc_cp_start(&self, cp: &Arc<BlkAllocCp>) {
        cp.snapshots
            .lock()
            .push((self.vdev.id(), self.vdev.allocator_state()));
    }
}

/// Typed metadata the index layer attaches to cached index blocks
pub trait IndexBuffer: Clone + Send + Sync + 'static {}

impl IndexBuffer for () {}

/// Block store of the index vdev, parameterized by the index layer's
/// buffer type
pub struct IndexBlkStore<B: IndexBuffer> {
    store: BlkStore,
    buffers: RwLock<HashMap<BlkId, B>>,
}

impl<B: IndexBuffer> IndexBlkStore<B> {
    /// Build an index store over its vdev
    pub fn new(store: BlkStore) -> Self {
        Self {
            store,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Attach typed metadata to a cached block
    pub fn attach_buffer(&self, blkid: BlkId, buffer: B) {
        self.buffers.write().insert(blkid, buffer);
    }

    /// Fetch the typed metadata attached to a block
    pub fn buffer(&self, blkid: BlkId) -> Option<B> {
        self.buffers.read().get(&blkid).cloned()
    }

    /// Free a block, dropping its attached buffer
    pub fn free(&self, blkid: BlkId) -> Result<()> {
        self.buffers.write().remove(&blkid);
        self.store.free(blkid)
    }
}

impl<B: IndexBuffer> std::ops::Deref for IndexBlkStore<B> {
    type Target = BlkStore;

    fn deref(&self) -> &BlkStore {
        &self.store
    }
}
