//! Log device
//!
//! An append-only ring of flush batches over the logdev block store.
//! Appends from every log store queue into the open batch; a flush
//! seals the batch, writes it atomically (one checksummed unit) and
//! only then reports per-record device keys back to the stores,
//! followed by one batch-completion call per touched store. Device
//! space is reclaimed in whole batches, strictly below a proven
//! globally safe key.
//!
//! Batch on-media format:
//! ```text
//! +--------+----------+---------+---------+----------+-----+
//! | Magic  | BatchId  | NumRecs | PayLen  | CRC32C   | ... |
//! | 4B     | 8B       | 4B      | 4B      | 4B       |     |
//! +--------+----------+---------+---------+----------+-----+
//! | per record: StoreId(4) Seq(8) Flags(1) Len(4)    | ... |
//! +--------------------------------------------------+-----+
//! | payloads, concatenated; padded to a page multiple      |
//! +--------------------------------------------------------+
//! ```

use crate::store::LogStoreCore;
use crate::types::{Cookie, LogDevKey, Lsn, TruncationInfo};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hearth_common::{compute_crc32c, round_up, BlkId, Error, LogStoreId, Result};
use hearth_storage::{BlkStore, MetaBlkMgr, MetaCookie};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const BATCH_MAGIC: u32 = 0x484C_4742; // "HLGB"
const WRAP_MAGIC: u32 = 0x484C_4757; // "HLGW"

/// magic(4) + batch_id(8) + num_records(4) + payload_len(4) + crc(4)
const BATCH_HEADER_SIZE: usize = 24;

/// store_id(4) + seq(8) + flags(1) + len(4)
const ENTRY_SIZE: usize = 17;

/// Meta-block name of the persisted log device superblock
pub const LOGDEV_META_NAME: &str = "logdev";

pub(crate) const FLAG_DATA: u8 = 0;
pub(crate) const FLAG_ROLLBACK: u8 = 1;

/// Log device tunables
#[derive(Clone, Debug)]
pub struct LogDevConfig {
    /// Cadence of the background flush thread
    pub flush_interval: Duration,
    /// Open-batch payload size that triggers an inline flush
    pub max_batch_bytes: usize,
    /// Whether to run the background flush thread
    pub auto_flush: bool,
}

impl Default for LogDevConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(20),
            max_batch_bytes: 1024 * 1024,
            auto_flush: true,
        }
    }
}

/// Persisted log device superblock: where the unreclaimed region starts
#[derive(Clone, Copy, Debug, Default)]
struct LogDevSuperblock {
    start_offset: u64,
    batch_floor: u64,
}

impl LogDevSuperblock {
    fn to_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64_le(self.start_offset);
        buf.put_u64_le(self.batch_floor);
        buf.freeze()
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::corrupt("logdev superblock too small"));
        }
        let mut buf = data;
        Ok(Self {
            start_offset: buf.get_u64_le(),
            batch_floor: buf.get_u64_le(),
        })
    }
}

struct PendingRecord {
    store_id: LogStoreId,
    seq: Lsn,
    flags: u8,
    data: Bytes,
    cookie: Cookie,
}

struct OpenBatch {
    id: u64,
    records: Vec<PendingRecord>,
    payload_bytes: usize,
}

impl OpenBatch {
    fn new(id: u64) -> Self {
        Self {
            id,
            records: Vec::new(),
            payload_bytes: 0,
        }
    }
}

struct EntryIdx {
    store_id: LogStoreId,
    seq: Lsn,
    flags: u8,
    /// Absolute region offset of the payload
    payload_pos: u64,
    len: u32,
}

struct BatchIdx {
    dev_offset: u64,
    size: u64,
    entries: Vec<EntryIdx>,
}

struct RingState {
    open: OpenBatch,
    write_offset: u64,
    start_offset: u64,
    batches: BTreeMap<u64, BatchIdx>,
}

/// Append-only batch ring over the logdev block store
pub struct LogDev {
    store: Arc<BlkStore>,
    meta: Arc<MetaBlkMgr>,
    cfg: LogDevConfig,
    page_size: u64,
    region_size: u64,
    state: Mutex<RingState>,
    stores: RwLock<BTreeMap<LogStoreId, Arc<LogStoreCore>>>,
    reserved: Mutex<BTreeSet<LogStoreId>>,
    meta_cookie: Mutex<Option<MetaCookie>>,
    /// Serializes flushes so completions are delivered in batch order
    flush_mtx: Mutex<()>,
    shutdown: Arc<AtomicBool>,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LogDev {
    /// Build a log device over its block store. `recovered_sb` is the
    /// superblock blob dispatched by the meta-block manager on reattach.
    pub fn new(
        store: Arc<BlkStore>,
        meta: Arc<MetaBlkMgr>,
        cfg: LogDevConfig,
        recovered_sb: Option<(Bytes, MetaCookie)>,
    ) -> Result<Arc<Self>> {
        let page_size = u64::from(store.page_size());
        let region_size = store.size();

        let (sb, cookie) = match recovered_sb {
            Some((blob, cookie)) => (LogDevSuperblock::from_bytes(&blob)?, Some(cookie)),
            None => (LogDevSuperblock::default(), None),
        };

        Ok(Arc::new(Self {
            state: Mutex::new(RingState {
                open: OpenBatch::new(sb.batch_floor),
                write_offset: sb.start_offset,
                start_offset: sb.start_offset,
                batches: BTreeMap::new(),
            }),
            store,
            meta,
            cfg,
            page_size,
            region_size,
            stores: RwLock::new(BTreeMap::new()),
            reserved: Mutex::new(BTreeSet::new()),
            meta_cookie: Mutex::new(cookie),
            flush_mtx: Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
            flusher: Mutex::new(None),
        }))
    }

    /// Reserve a store id ahead of registration
    pub fn reserve(&self, store_id: LogStoreId) {
        self.reserved.lock().insert(store_id);
    }

    /// Release a reserved store id
    pub fn release(&self, store_id: LogStoreId) {
        self.reserved.lock().remove(&store_id);
        self.stores.write().remove(&store_id);
    }

    /// Register the completion sink of one log store
    pub(crate) fn register_store(&self, store_id: LogStoreId, core: Arc<LogStoreCore>) {
        self.reserved.lock().insert(store_id);
        self.stores.write().insert(store_id, core);
    }

    pub(crate) fn registered_stores(&self) -> Vec<Arc<LogStoreCore>> {
        self.stores.read().values().cloned().collect()
    }

    /// Queue a record into the open batch. The returned key becomes
    /// meaningful once the enclosing flush completes.
    pub(crate) fn append(
        &self,
        store_id: LogStoreId,
        seq: Lsn,
        flags: u8,
        data: Bytes,
        cookie: Cookie,
    ) -> Result<LogDevKey> {
        if !self.reserved.lock().contains(&store_id) {
            return Err(Error::invalid_argument(format!(
                "store {store_id} is not reserved on this log device"
            )));
        }

        let over_threshold;
        let key;
        {
            let mut state = self.state.lock();
            key = LogDevKey::new(state.open.id, state.open.records.len() as u32);
            state.open.payload_bytes += data.len();
            state.open.records.push(PendingRecord {
                store_id,
                seq,
                flags,
                data,
                cookie,
            });
            over_threshold = state.open.payload_bytes >= self.cfg.max_batch_bytes;
        }

        if over_threshold {
            self.flush()?;
        }
        Ok(key)
    }

    /// Seal and persist the open batch, then deliver completions.
    ///
    /// Returns the flush batch key, or `None` if the batch was empty.
    /// Must not be called from inside a completion callback.
    pub fn flush(&self) -> Result<Option<LogDevKey>> {
        let _serialize = self.flush_mtx.lock();

        // Seal the open batch and reserve its place in the ring
        let (batch, dev_offset, encoded, wrap_at) = {
            let mut state = self.state.lock();
            if state.open.records.is_empty() {
                return Ok(None);
            }
            let encoded = Self::encode_batch(&state.open, self.page_size);
            let size = encoded.len() as u64;
            // Placement failure leaves the open batch untouched
            let (dev_offset, wrap_at) = self.place(&state, size)?;

            let next_id = state.open.id + 1;
            let batch = std::mem::replace(&mut state.open, OpenBatch::new(next_id));
            state.write_offset = dev_offset + size;
            (batch, dev_offset, encoded, wrap_at)
        };

        if let Some(wrap_offset) = wrap_at {
            let mut marker = BytesMut::with_capacity(self.page_size as usize);
            marker.put_u32_le(WRAP_MAGIC);
            marker.resize(self.page_size as usize, 0);
            self.write_region(wrap_offset, &marker.freeze())?;
        }
        self.write_region(dev_offset, &encoded)?;
        self.store.sync()?;

        // Index the persisted batch
        let flush_key = LogDevKey::new(batch.id, (batch.records.len() - 1) as u32);
        {
            let mut state = self.state.lock();
            let mut payload_pos = dev_offset
                + (BATCH_HEADER_SIZE + batch.records.len() * ENTRY_SIZE) as u64;
            let entries = batch
                .records
                .iter()
                .map(|rec| {
                    let entry = EntryIdx {
                        store_id: rec.store_id,
                        seq: rec.seq,
                        flags: rec.flags,
                        payload_pos,
                        len: rec.data.len() as u32,
                    };
                    payload_pos += rec.data.len() as u64;
                    entry
                })
                .collect();
            state.batches.insert(
                batch.id,
                BatchIdx {
                    dev_offset,
                    size: encoded.len() as u64,
                    entries,
                },
            );
        }

        debug!(
            batch = batch.id,
            records = batch.records.len(),
            bytes = encoded.len(),
            "flushed log batch"
        );

        // Record completions in batch order, then one batch completion
        // per touched store
        let stores = self.stores.read();
        let mut touched: Vec<LogStoreId> = Vec::new();
        for (offset, rec) in batch.records.iter().enumerate() {
            let Some(core) = stores.get(&rec.store_id) else {
                warn!(store = rec.store_id, "completion for unregistered store dropped");
                continue;
            };
            core.on_write_completion(
                rec.seq,
                LogDevKey::new(batch.id, offset as u32),
                rec.cookie,
                rec.flags,
            );
            if !touched.contains(&rec.store_id) {
                touched.push(rec.store_id);
            }
        }
        for store_id in touched {
            if let Some(core) = stores.get(&store_id) {
                core.on_batch_completion(flush_key);
            }
        }

        Ok(Some(flush_key))
    }

    /// Pick the ring position for a sealed batch of `size` bytes.
    /// Returns `(dev_offset, wrap_marker_offset)`.
    fn place(&self, state: &RingState, size: u64) -> Result<(u64, Option<u64>)> {
        if size > self.region_size {
            return Err(Error::OutOfSpace);
        }
        let wo = state.write_offset;
        let so = state.start_offset;
        let unreclaimed = !state.batches.is_empty();

        if wo >= so && !(unreclaimed && wo == so) {
            // Contiguous tail ahead of us
            if wo + size <= self.region_size {
                return Ok((wo, None));
            }
            // Wrap: the head of the ring must leave room
            if size < so {
                let marker = (wo + self.page_size <= self.region_size).then_some(wo);
                return Ok((0, marker));
            }
            return Err(Error::OutOfSpace);
        }
        // Already wrapped: must stay strictly below the start offset
        if wo + size < so {
            return Ok((wo, None));
        }
        Err(Error::OutOfSpace)
    }

    fn encode_batch(batch: &OpenBatch, page_size: u64) -> Bytes {
        let body_len = batch.records.len() * ENTRY_SIZE + batch.payload_bytes;
        let total = round_up((BATCH_HEADER_SIZE + body_len) as u64, page_size) as usize;

        let mut body = BytesMut::with_capacity(body_len);
        for rec in &batch.records {
            body.put_u32_le(rec.store_id);
            body.put_i64_le(rec.seq);
            body.put_u8(rec.flags);
            body.put_u32_le(rec.data.len() as u32);
        }
        for rec in &batch.records {
            body.put_slice(&rec.data);
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(BATCH_MAGIC);
        buf.put_u64_le(batch.id);
        buf.put_u32_le(batch.records.len() as u32);
        buf.put_u32_le(batch.payload_bytes as u32);
        buf.put_u32_le(compute_crc32c(&body));
        buf.put_slice(&body);
        buf.resize(total, 0);
        buf.freeze()
    }

    fn page_blkid(&self, page: u64, npages: u32) -> BlkId {
        let ppc = u64::from(self.store.pages_per_chunk());
        BlkId::new((page / ppc) as u32, (page % ppc) as u32, npages)
    }

    /// Write a page-aligned buffer at a region byte offset, splitting
    /// at chunk boundaries
    fn write_region(&self, offset: u64, data: &Bytes) -> Result<()> {
        debug_assert_eq!(offset % self.page_size, 0);
        debug_assert_eq!(data.len() as u64 % self.page_size, 0);

        let ppc = u64::from(self.store.pages_per_chunk());
        let mut page = offset / self.page_size;
        let mut pos = 0usize;
        while pos < data.len() {
            let left_in_chunk = ppc - (page % ppc);
            let pages_left = (data.len() - pos) as u64 / self.page_size;
            let n = left_in_chunk.min(pages_left);
            let bytes = data.slice(pos..pos + (n * self.page_size) as usize);
            self.store.write(self.page_blkid(page, n as u32), &bytes)?;
            page += n;
            pos += (n * self.page_size) as usize;
        }
        Ok(())
    }

    /// Read `len` bytes at a region byte offset (not necessarily
    /// page-aligned)
    fn read_region(&self, offset: u64, len: usize) -> Result<Bytes> {
        let ppc = u64::from(self.store.pages_per_chunk());
        let first_page = offset / self.page_size;
        let end_page = (offset + len as u64).div_ceil(self.page_size);

        let mut buf = BytesMut::with_capacity(((end_page - first_page) * self.page_size) as usize);
        let mut page = first_page;
        while page < end_page {
            let left_in_chunk = ppc - (page % ppc);
            let n = left_in_chunk.min(end_page - page);
            let bytes = self.store.read(self.page_blkid(page, n as u32))?;
            buf.put_slice(&bytes);
            page += n;
        }
        let skip = (offset - first_page * self.page_size) as usize;
        Ok(buf.freeze().slice(skip..skip + len))
    }

    /// Read a persisted record by its device key
    pub fn read(&self, key: LogDevKey) -> Result<Bytes> {
        let (pos, len) = {
            let state = self.state.lock();
            let batch = state
                .batches
                .get(&key.batch)
                .ok_or_else(|| Error::out_of_range(format!("batch {} reclaimed", key.batch)))?;
            let entry = batch
                .entries
                .get(key.offset as usize)
                .ok_or_else(|| Error::out_of_range(format!("no record at {key}")))?;
            (entry.payload_pos, entry.len as usize)
        };
        self.read_region(pos, len)
    }

    /// Reclaim device space strictly below the key. The caller must
    /// have proven it is the global safe boundary.
    pub fn truncate(&self, key: LogDevKey) -> Result<()> {
        let mut state = self.state.lock();
        state.batches.retain(|&id, _| id > key.batch);
        let new_start = state
            .batches
            .values()
            .next()
            .map(|b| b.dev_offset)
            .unwrap_or(state.write_offset);
        state.start_offset = new_start;
        let sb = LogDevSuperblock {
            start_offset: new_start,
            batch_floor: key.batch + 1,
        };
        drop(state);

        self.persist_superblock(sb)?;
        info!(upto = %key, "log device truncated");
        Ok(())
    }

    fn persist_superblock(&self, sb: LogDevSuperblock) -> Result<()> {
        let mut cookie = self.meta_cookie.lock();
        match *cookie {
            Some(c) => self.meta.update_meta_blk(c, sb.to_bytes()),
            None => {
                *cookie = Some(self.meta.write_meta_blk(LOGDEV_META_NAME, sb.to_bytes())?);
                Ok(())
            }
        }
    }

    /// Replay every unreclaimed batch in log order, dispatching each
    /// record to its registered store. Tolerates a torn trailing batch.
    pub fn recover(&self) -> Result<()> {
        let mut state = self.state.lock();
        let stores = self.stores.read();

        let mut pos = state.start_offset;
        let mut wrapped = false;
        let mut last_batch: Option<u64> = None;
        let mut replayed = 0usize;

        loop {
            if pos + self.page_size > self.region_size {
                if wrapped {
                    break;
                }
                wrapped = true;
                pos = 0;
                continue;
            }
            let header = self.read_region(pos, BATCH_HEADER_SIZE)?;
            let mut cursor = &header[..];
            let magic = cursor.get_u32_le();
            if magic == WRAP_MAGIC {
                if wrapped {
                    break;
                }
                wrapped = true;
                pos = 0;
                continue;
            }
            if magic != BATCH_MAGIC {
                break;
            }
            let batch_id = cursor.get_u64_le();
            let num_records = cursor.get_u32_le() as usize;
            let payload_len = cursor.get_u32_le() as usize;
            let stored_crc = cursor.get_u32_le();

            let body_len = num_records * ENTRY_SIZE + payload_len;
            let total = round_up((BATCH_HEADER_SIZE + body_len) as u64, self.page_size);
            if num_records == 0 || pos + total > self.region_size {
                break;
            }
            if last_batch.is_some_and(|last| batch_id != last + 1) {
                break;
            }

            let body = self.read_region(pos + BATCH_HEADER_SIZE as u64, body_len)?;
            if compute_crc32c(&body) != stored_crc {
                debug!(batch = batch_id, "torn trailing batch, stopping replay");
                break;
            }

            // Index the batch and dispatch its records
            let mut entries = Vec::with_capacity(num_records);
            let mut cursor = &body[..];
            for _ in 0..num_records {
                let store_id = cursor.get_u32_le();
                let seq = cursor.get_i64_le();
                let flags = cursor.get_u8();
                let len = cursor.get_u32_le();
                entries.push(EntryIdx {
                    store_id,
                    seq,
                    flags,
                    payload_pos: 0,
                    len,
                });
            }
            let mut payload_pos = pos + (BATCH_HEADER_SIZE + num_records * ENTRY_SIZE) as u64;
            let mut payload_off = num_records * ENTRY_SIZE;
            let flush_key = LogDevKey::new(batch_id, (num_records - 1) as u32);
            for (offset, entry) in entries.iter_mut().enumerate() {
                entry.payload_pos = payload_pos;
                let payload = body.slice(payload_off..payload_off + entry.len as usize);
                payload_pos += u64::from(entry.len);
                payload_off += entry.len as usize;

                match stores.get(&entry.store_id) {
                    Some(core) => core.on_replay_found(
                        entry.seq,
                        LogDevKey::new(batch_id, offset as u32),
                        flush_key,
                        entry.flags,
                        payload,
                    ),
                    None => warn!(store = entry.store_id, "replayed record for unknown store"),
                }
                replayed += 1;
            }

            state.batches.insert(
                batch_id,
                BatchIdx {
                    dev_offset: pos,
                    size: total,
                    entries,
                },
            );
            last_batch = Some(batch_id);
            pos += total;
        }

        state.write_offset = pos;
        if let Some(last) = last_batch {
            state.open = OpenBatch::new(last + 1);
        }
        info!(
            records = replayed,
            batches = state.batches.len(),
            "log device replay complete"
        );
        Ok(())
    }

    /// One global safe-truncation round: take the minimum of every
    /// store's safe boundary, truncate the device to it, and confirm it
    /// back to the stores.
    pub fn run_truncation_round(&self) -> Result<Option<LogDevKey>> {
        let stores = self.registered_stores();
        let min: Option<TruncationInfo> = stores
            .iter()
            .filter_map(|core| core.pre_device_truncation())
            .min_by_key(|info| info.key);
        let Some(min) = min else {
            return Ok(None);
        };

        self.truncate(min.key)?;
        for core in &stores {
            core.post_device_truncation(min.key);
        }
        Ok(Some(min.key))
    }

    /// Start the background flush thread
    pub fn start_flusher(self: Arc<Self>) {
        if !self.cfg.auto_flush {
            return;
        }
        let dev = Arc::clone(&self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.cfg.flush_interval;
        let handle = thread::spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(interval);
                if let Err(e) = dev.flush() {
                    warn!("background flush failed: {e}");
                }
            }
        });
        *self.flusher.lock() = Some(handle);
    }

    /// Stop the flusher and persist any open batch
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        self.flush()?;
        self.store.sync()
    }
}
