//! Meta-block manager
//!
//! A registry of small, named superblocks persisted in the meta vdev.
//! Subsystems register a handler by name before `start`; on reattach the
//! region is scanned and every record is dispatched to its handler with
//! the blob and a cookie usable for later updates.
//!
//! The meta region is owned wholesale by this manager (it bypasses the
//! store's allocator): page 0 holds the region header, records follow
//! page-aligned. The region is small, so updates rewrite it in full.
//!
//! Region layout:
//! ```text
//! +--------+-------+---------+--------+------+
//! | Header | Rec 0 | Rec 1   | ...    | zero |
//! | 1 page | pages | pages   |        | page |
//! +--------+-------+---------+--------+------+
//! ```

use crate::blkstore::BlkStore;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hearth_common::{compute_crc32c, BlkId, Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

const REGION_MAGIC: [u8; 8] = *b"HRTHMETA";
const REGION_VERSION: u32 = 1;
const RECORD_MAGIC: u32 = 0x4D42_4C4B; // "MBLK"

/// magic(4) + cookie(8) + name_len(2) + blob_len(4) + crc(4)
const RECORD_HEADER_SIZE: usize = 22;

/// Cookie identifying one meta block across updates
pub type MetaCookie = u64;

/// Handler invoked per found meta block: `(blob, cookie)`
pub type MetaFoundCb = Arc<dyn Fn(Bytes, MetaCookie) + Send + Sync>;

/// Handler invoked when the region is flushed
pub type MetaFlushCb = Arc<dyn Fn() + Send + Sync>;

struct MetaHandler {
    on_found: MetaFoundCb,
    #[allow(dead_code)]
    on_flush: Option<MetaFlushCb>,
}

#[derive(Clone)]
struct MetaRecord {
    cookie: MetaCookie,
    name: String,
    blob: Bytes,
}

struct MetaState {
    store: Option<Arc<BlkStore>>,
    records: Vec<MetaRecord>,
    next_cookie: MetaCookie,
}

/// Registry of named superblocks stored in the meta vdev
pub struct MetaBlkMgr {
    handlers: RwLock<HashMap<String, MetaHandler>>,
    state: Mutex<MetaState>,
}

impl MetaBlkMgr {
    /// Create an empty manager; register handlers, then call `start`
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            state: Mutex::new(MetaState {
                store: None,
                records: Vec::new(),
                next_cookie: 1,
            }),
        }
    }

    /// Register a handler for meta blocks of the given name.
    ///
    /// Must happen before `start` for the handler to see existing
    /// records on reattach.
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        on_found: MetaFoundCb,
        on_flush: Option<MetaFlushCb>,
    ) {
        self.handlers
            .write()
            .insert(name.into(), MetaHandler { on_found, on_flush });
    }

    /// Take ownership of the meta store. On first boot the region is
    /// formatted; on reattach it is scanned and every record dispatched
    /// to its registered handler.
    pub fn start(&self, store: Arc<BlkStore>, first_boot: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.store = Some(store.clone());

        if first_boot {
            Self::write_region(&store, &[])?;
            info!("meta region formatted");
            return Ok(());
        }

        let records = Self::scan_region(&store)?;
        state.next_cookie = records.iter().map(|r| r.cookie).max().unwrap_or(0) + 1;
        info!(records = records.len(), "meta region scanned");

        let handlers = self.handlers.read();
        for record in &records {
            match handlers.get(&record.name) {
                Some(handler) => (handler.on_found)(record.blob.clone(), record.cookie),
                None => warn!(name = %record.name, "meta block without registered handler"),
            }
        }
        state.records = records;
        Ok(())
    }

    /// Persist a new named blob; returns its cookie
    pub fn write_meta_blk(&self, name: impl Into<String>, blob: Bytes) -> Result<MetaCookie> {
        let mut state = self.state.lock();
        let cookie = state.next_cookie;
        state.next_cookie += 1;
        let record = MetaRecord {
            cookie,
            name: name.into(),
            blob,
        };
        state.records.push(record);
        self.flush_locked(&state)?;
        Ok(cookie)
    }

    /// Atomically replace the blob of an existing meta block
    pub fn update_meta_blk(&self, cookie: MetaCookie, blob: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        let record = state
            .records
            .iter_mut()
            .find(|r| r.cookie == cookie)
            .ok_or_else(|| Error::invalid_argument(format!("unknown meta cookie {cookie}")))?;
        record.blob = blob;
        self.flush_locked(&state)
    }

    /// Destroy a meta block
    pub fn remove_meta_blk(&self, cookie: MetaCookie) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.records.len();
        state.records.retain(|r| r.cookie != cookie);
        if state.records.len() == before {
            return Err(Error::invalid_argument(format!(
                "unknown meta cookie {cookie}"
            )));
        }
        self.flush_locked(&state)
    }

    fn flush_locked(&self, state: &MetaState) -> Result<()> {
        let store = state
            .store
            .as_ref()
            .ok_or_else(|| Error::storage("meta manager not started"))?;
        Self::write_region(store, &state.records)
    }

    fn page_blkid(store: &BlkStore, page: u64, npages: u32) -> BlkId {
        let ppc = u64::from(store.pages_per_chunk());
        BlkId::new((page / ppc) as u32, (page % ppc) as u32, npages)
    }

    fn write_page_run(store: &BlkStore, page: u64, data: &Bytes) -> Result<()> {
        let npages = (data.len() as u64).div_ceil(u64::from(store.page_size())) as u32;
        store.write(Self::page_blkid(store, page, npages), data)
    }

    fn encode_record(record: &MetaRecord, page_size: usize) -> Bytes {
        let name = record.name.as_bytes();
        let len = RECORD_HEADER_SIZE + name.len() + record.blob.len();
        let mut buf = BytesMut::with_capacity(len.div_ceil(page_size) * page_size);
        buf.put_u32_le(RECORD_MAGIC);
        buf.put_u64_le(record.cookie);
        buf.put_u16_le(name.len() as u16);
        buf.put_u32_le(record.blob.len() as u32);
        let mut payload = Vec::with_capacity(name.len() + record.blob.len());
        payload.extend_from_slice(name);
        payload.extend_from_slice(&record.blob);
        buf.put_u32_le(compute_crc32c(&payload));
        buf.put_slice(&payload);
        buf.resize(len.div_ceil(page_size) * page_size, 0);
        buf.freeze()
    }

    fn write_region(store: &BlkStore, records: &[MetaRecord]) -> Result<()> {
        let page_size = store.page_size() as usize;
        let ppc = u64::from(store.pages_per_chunk());
        let total_pages = ppc * u64::from(store.num_chunks());

        // Header page
        let mut hdr = BytesMut::with_capacity(page_size);
        hdr.put_slice(&REGION_MAGIC);
        hdr.put_u32_le(REGION_VERSION);
        hdr.put_u32_le(records.len() as u32);
        let crc = compute_crc32c(&hdr[..]);
        hdr.put_u32_le(crc);
        hdr.resize(page_size, 0);

        let mut page = 1u64;
        let mut writes: Vec<(u64, Bytes)> = Vec::with_capacity(records.len());
        for record in records {
            let encoded = Self::encode_record(record, page_size);
            let npages = (encoded.len() / page_size) as u64;
            if npages > ppc {
                return Err(Error::invalid_argument(format!(
                    "meta blob {} exceeds the meta chunk size",
                    record.name
                )));
            }
            // A record never straddles chunks; skip to the next chunk
            // boundary, leaving a zeroed page as a skip marker.
            if (page % ppc) + npages > ppc {
                writes.push((page, Bytes::from(vec![0u8; page_size])));
                page = (page / ppc + 1) * ppc;
            }
            if page + npages > total_pages {
                return Err(Error::OutOfSpace);
            }
            writes.push((page, encoded));
            page += npages;
        }
        // Terminating zero page guards stale trailing records
        if page < total_pages {
            writes.push((page, Bytes::from(vec![0u8; page_size])));
        }

        Self::write_page_run(store, 0, &hdr.freeze())?;
        for (page, data) in writes {
            Self::write_page_run(store, page, &data)?;
        }
        store.sync()
    }

    fn scan_region(store: &BlkStore) -> Result<Vec<MetaRecord>> {
        let page_size = store.page_size() as usize;
        let ppc = u64::from(store.pages_per_chunk());

        let hdr = store.read(Self::page_blkid(store, 0, 1))?;
        if hdr.len() < 20 || hdr[..8] != REGION_MAGIC {
            return Err(Error::InitFailed(
                "meta region was never formatted; retry with re-init".into(),
            ));
        }
        let mut cursor = &hdr[8..];
        let version = cursor.get_u32_le();
        if version != REGION_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported meta region version {version}"
            )));
        }
        let count = cursor.get_u32_le();
        let stored_crc = cursor.get_u32_le();
        if compute_crc32c(&hdr[..16]) != stored_crc {
            return Err(Error::corrupt("meta region header checksum mismatch"));
        }

        let mut records = Vec::with_capacity(count as usize);
        let mut page = 1u64;
        for _ in 0..count {
            let first = store.read(Self::page_blkid(store, page, 1))?;
            let first = if u32::from_le_bytes(first[0..4].try_into().unwrap()) != RECORD_MAGIC {
                // Skip marker: the record was pushed to the next chunk
                page = (page / ppc + 1) * ppc;
                store.read(Self::page_blkid(store, page, 1))?
            } else {
                first
            };

            let mut cursor = &first[..];
            let magic = cursor.get_u32_le();
            if magic != RECORD_MAGIC {
                return Err(Error::corrupt("meta record magic mismatch"));
            }
            let cookie = cursor.get_u64_le();
            let name_len = cursor.get_u16_le() as usize;
            let blob_len = cursor.get_u32_le() as usize;
            let stored_crc = cursor.get_u32_le();

            let total = RECORD_HEADER_SIZE + name_len + blob_len;
            let npages = total.div_ceil(page_size) as u64;
            let full = if npages == 1 {
                first
            } else {
                store.read(Self::page_blkid(store, page, npages as u32))?
            };

            let payload = &full[RECORD_HEADER_SIZE..total];
            if compute_crc32c(payload) != stored_crc {
                return Err(Error::corrupt("meta record checksum mismatch"));
            }
            let name = std::str::from_utf8(&payload[..name_len])
                .map_err(|_| Error::corrupt("meta record name is not utf-8"))?
                .to_string();
            let blob = Bytes::copy_from_slice(&payload[name_len..]);

            records.push(MetaRecord { cookie, name, blob });
            page += npages;
        }
        Ok(records)
    }
}

impl Default for MetaBlkMgr {
    fn default() -> Self {
        Self::new()
    }
}
