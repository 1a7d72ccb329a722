//! Virtual devices
//!
//! A vdev is a typed slice of the fleet's capacity, made of fixed-size
//! chunks striped round-robin across the raw devices. Chunk `i` lives on
//! device `i % ndev` at the same per-device offset on every device,
//! which keeps the vdev catalog identical across the fleet.
//!
//! Each vdev owns a page allocator handing out contiguous runs within a
//! single chunk; a [`BlkId`] never straddles chunks.

use crate::device::DeviceManager;
use bytes::Bytes;
use hearth_common::{BlkAllocHints, BlkId, Error, Result, VdevId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Bitmap of allocated pages within one chunk: 0 = free, 1 = used
struct PageBitmap {
    bits: Vec<u8>,
    npages: u32,
    free: u32,
}

impl PageBitmap {
    fn new(npages: u32) -> Self {
        Self {
            bits: vec![0u8; (npages as usize).div_ceil(8)],
            npages,
            free: npages,
        }
    }

    fn is_set(&self, page: u32) -> bool {
        self.bits[(page / 8) as usize] & (1 << (page % 8)) != 0
    }

    fn set(&mut self, page: u32) {
        self.bits[(page / 8) as usize] |= 1 << (page % 8);
    }

    fn clear(&mut self, page: u32) {
        self.bits[(page / 8) as usize] &= !(1 << (page % 8));
    }

    /// Find and claim a contiguous run of `count` free pages
    fn allocate_run(&mut self, count: u32) -> Option<u32> {
        if count == 0 || count > self.free {
            return None;
        }

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for page in 0..self.npages {
            if self.is_set(page) {
                run_start = page + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len >= count {
                    for p in run_start..run_start + count {
                        self.set(p);
                    }
                    self.free -= count;
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Release a previously claimed run
    fn free_run(&mut self, start: u32, count: u32) -> Result<()> {
        if u64::from(start) + u64::from(count) > u64::from(self.npages) {
            return Err(Error::invalid_argument("page run out of range"));
        }
        for page in start..start + count {
            if !self.is_set(page) {
                return Err(Error::invalid_argument(format!(
                    "page {page} is not allocated"
                )));
            }
        }
        for page in start..start + count {
            self.clear(page);
        }
        self.free += count;
        Ok(())
    }

    fn mark_run(&mut self, start: u32, count: u32) {
        for page in start..start + count {
            if !self.is_set(page) {
                self.set(page);
                self.free -= 1;
            }
        }
    }
}

/// Per-vdev contiguous page allocator
struct ChunkAllocator {
    chunks: Vec<Mutex<PageBitmap>>,
    pages_per_chunk: u32,
    used_pages: AtomicU64,
    /// Round-robin start chunk for allocation scans
    next_chunk: AtomicU32,
    recovered: AtomicBool,
}

impl ChunkAllocator {
    fn new(num_chunks: u32, pages_per_chunk: u32) -> Self {
        Self {
            chunks: (0..num_chunks)
                .map(|_| Mutex::new(PageBitmap::new(pages_per_chunk)))
                .collect(),
            pages_per_chunk,
            used_pages: AtomicU64::new(0),
            next_chunk: AtomicU32::new(0),
            recovered: AtomicBool::new(false),
        }
    }

    fn allocate(&self, npages: u32, preferred_chunk: Option<u32>) -> Option<BlkId> {
        if npages == 0 || npages > self.pages_per_chunk {
            return None;
        }

        let nchunks = self.chunks.len() as u32;
        let start = preferred_chunk
            .filter(|&c| c < nchunks)
            .unwrap_or_else(|| self.next_chunk.load(Ordering::Relaxed) % nchunks);

        for i in 0..nchunks {
            let chunk = (start + i) % nchunks;
            let mut bitmap = self.chunks[chunk as usize].lock();
            if let Some(offset) = bitmap.allocate_run(npages) {
                drop(bitmap);
                self.used_pages.fetch_add(u64::from(npages), Ordering::Relaxed);
                self.next_chunk.store(chunk, Ordering::Relaxed);
                return Some(BlkId::new(chunk, offset, npages));
            }
        }
        None
    }

    fn free(&self, blkid: BlkId) -> Result<()> {
        let bitmap = self
            .chunks
            .get(blkid.chunk as usize)
            .ok_or_else(|| Error::invalid_argument(format!("unknown chunk {}", blkid.chunk)))?;
        bitmap.lock().free_run(blkid.offset, blkid.nblks)?;
        self.used_pages
            .fetch_sub(u64::from(blkid.nblks), Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot all chunk bitmaps for checkpoint persistence
    fn state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.lock().bits);
        }
        out
    }

    /// Restore bitmaps from a checkpoint snapshot
    fn restore(&self, state: &[u8]) {
        let per_chunk = (self.pages_per_chunk as usize).div_ceil(8);
        let mut used = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let Some(bits) = state.get(i * per_chunk..(i + 1) * per_chunk) else {
                break;
            };
            let mut bitmap = chunk.lock();
            for page in 0..bitmap.npages {
                if bits[(page / 8) as usize] & (1 << (page % 8)) != 0 {
                    bitmap.mark_run(page, 1);
                    used += 1;
                }
            }
        }
        self.used_pages.store(used, Ordering::Relaxed);
    }
}

/// One virtual device: chunk geometry, allocator and I/O routing
pub struct Vdev {
    mgr: Arc<DeviceManager>,
    id: VdevId,
    page_size: u32,
    chunk_size: u64,
    num_chunks: u32,
    start_offset: u64,
    mirrors: u8,
    size: u64,
    failed: AtomicBool,
    allocator: ChunkAllocator,
}

impl Vdev {
    /// Build a vdev over its persisted record
    pub fn new(mgr: Arc<DeviceManager>, record: &crate::layout::VdevRecord) -> Self {
        let pages_per_chunk = record.pages_per_chunk();
        Self {
            mgr,
            id: record.id,
            page_size: record.page_size,
            chunk_size: record.chunk_size,
            num_chunks: record.num_chunks,
            start_offset: record.start_offset,
            mirrors: record.mirrors,
            size: record.size,
            failed: AtomicBool::new(record.failed),
            allocator: ChunkAllocator::new(record.num_chunks, pages_per_chunk),
        }
    }

    /// Vdev identifier
    pub fn id(&self) -> VdevId {
        self.id
    }

    /// Page size exposed by this vdev
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Pages per chunk
    pub fn pages_per_chunk(&self) -> u32 {
        (self.chunk_size / u64::from(self.page_size)) as u32
    }

    /// Number of chunks
    pub fn num_chunks(&self) -> u32 {
        self.num_chunks
    }

    /// Mirror copies per chunk
    pub fn mirrors(&self) -> u8 {
        self.mirrors
    }

    /// Total capacity in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes currently allocated
    pub fn used_size(&self) -> u64 {
        self.allocator.used_pages.load(Ordering::Relaxed) * u64::from(self.page_size)
    }

    /// Bytes still allocatable
    pub fn available_size(&self) -> u64 {
        self.size - self.used_size()
    }

    /// Whether this vdev was poisoned by a device error
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn check_failed(&self) -> Result<()> {
        if self.is_failed() {
            return Err(Error::VdevFailed(self.id));
        }
        Ok(())
    }

    /// Allocate a contiguous run of pages.
    ///
    /// A device preference biases the scan to start at a chunk placed
    /// on that device; chunk `c` lives on device `c % ndev`.
    pub fn alloc_contiguous(&self, npages: u32, hints: &BlkAllocHints) -> Result<BlkId> {
        self.check_failed()?;
        let preferred_chunk = hints
            .preferred_dev
            .map(|dev| dev % self.mgr.num_devices())
            .filter(|&chunk| chunk < self.num_chunks);
        self.allocator
            .allocate(npages, preferred_chunk)
            .ok_or(Error::OutOfSpace)
    }

    /// Free a previously allocated run
    pub fn free(&self, blkid: BlkId) -> Result<()> {
        self.allocator.free(blkid)
    }

    fn location(&self, blkid: BlkId, mirror: u8) -> Result<(u32, u64)> {
        if blkid.chunk >= self.num_chunks
            || u64::from(blkid.offset) + u64::from(blkid.nblks) > self.chunk_size / u64::from(self.page_size)
        {
            return Err(Error::invalid_argument(format!(
                "blkid {blkid} out of range for vdev {}",
                self.id
            )));
        }
        let ndev = self.mgr.num_devices();
        let dev = (blkid.chunk + u32::from(mirror)) % ndev;
        // Mirrored chunks occupy the same slot on every device.
        let slot = if self.mirrors > 0 {
            u64::from(blkid.chunk)
        } else {
            u64::from(blkid.chunk / ndev)
        };
        let offset = self.start_offset
            + slot * self.chunk_size
            + u64::from(blkid.offset) * u64::from(self.page_size);
        Ok((dev, offset))
    }

    fn fail_on_io_error<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(Error::DeviceIo(_)) = &res {
            self.failed.store(true, Ordering::Release);
            self.mgr.mark_vdev_failed(self.id);
        }
        res
    }

    /// Write a buffer to the pages of `blkid`, mirroring if configured
    pub fn write(&self, blkid: BlkId, data: &[u8]) -> Result<()> {
        self.check_failed()?;
        let extent = u64::from(blkid.nblks) * u64::from(self.page_size);
        if data.len() as u64 > extent {
            return Err(Error::invalid_argument("buffer exceeds block extent"));
        }

        for mirror in 0..=self.mirrors {
            let (dev, offset) = self.location(blkid, mirror)?;
            self.fail_on_io_error(self.mgr.write_at(dev, offset, data))?;
        }
        Ok(())
    }

    /// Read the full extent of `blkid` from its primary copy
    pub fn read(&self, blkid: BlkId) -> Result<Bytes> {
        self.read_mirror(blkid, 0)
    }

    /// Read the extent of `blkid` from the given mirror copy
    pub fn read_mirror(&self, blkid: BlkId, mirror: u8) -> Result<Bytes> {
        self.check_failed()?;
        if mirror > self.mirrors {
            return Err(Error::invalid_argument(format!(
                "vdev {} has {} mirrors, asked for copy {mirror}",
                self.id, self.mirrors
            )));
        }
        let (dev, offset) = self.location(blkid, mirror)?;
        let mut buf = vec![0u8; blkid.nblks as usize * self.page_size as usize];
        self.fail_on_io_error(self.mgr.read_at(dev, offset, &mut buf))?;
        Ok(Bytes::from(buf))
    }

    /// Sync every device this vdev stripes over
    pub fn sync(&self) -> Result<()> {
        self.mgr.sync_all()
    }

    /// Atomically rewrite this vdev's persisted context blob
    pub fn update_context(&self, blob: &[u8]) -> Result<()> {
        self.mgr.update_vdev_context(self.id, blob)
    }

    /// Snapshot the allocator state for a checkpoint
    pub fn allocator_state(&self) -> Vec<u8> {
        self.allocator.state()
    }

    /// Restore allocator state from a checkpoint snapshot
    pub fn restore_allocator(&self, state: &[u8]) {
        self.allocator.restore(state);
    }

    /// Mark the allocator's on-disk state as reconciled after recovery
    pub fn recovery_done(&self) {
        self.allocator.recovered.store(true, Ordering::Release);
    }
}
