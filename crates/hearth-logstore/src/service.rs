//! Log-store service
//!
//! Owns the log device, allocates store ids, persists the store
//! registry through the meta-block manager, orchestrates recovery
//! replay and runs the global safe-truncation protocol.
//!
//! On reattach, callers must open their stores and register callbacks
//! before calling [`LogStoreService::replay`]; replay dispatches each
//! surviving record to its store and then fires every store's
//! replay-done callback.

use crate::logdev::LogDev;
use crate::store::{LogStore, LogStoreCore};
use crate::types::{LogDevKey, Lsn};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hearth_common::{Error, LogStoreId, Result};
use hearth_storage::{MetaBlkMgr, MetaCookie};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Meta-block name of the persisted store registry
pub const LOGSTORE_META_NAME: &str = "logstore";

struct Registry {
    ids: BTreeSet<LogStoreId>,
    cookie: Option<MetaCookie>,
}

impl Registry {
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.ids.len() * 4);
        buf.put_u32_le(self.ids.len() as u32);
        for id in &self.ids {
            buf.put_u32_le(*id);
        }
        buf.freeze()
    }

    fn from_bytes(data: &[u8]) -> Result<BTreeSet<LogStoreId>> {
        if data.len() < 4 {
            return Err(Error::corrupt("log store registry too small"));
        }
        let mut buf = data;
        let count = buf.get_u32_le() as usize;
        if buf.len() < count * 4 {
            return Err(Error::corrupt("log store registry truncated"));
        }
        Ok((0..count).map(|_| buf.get_u32_le()).collect())
    }
}

/// Coordinator of every log store sharing one log device
pub struct LogStoreService {
    logdev: Arc<LogDev>,
    meta: Arc<MetaBlkMgr>,
    registry: Mutex<Registry>,
}

impl LogStoreService {
    /// Build the service. `recovered_registry` is the registry blob
    /// dispatched by the meta-block manager on reattach.
    pub fn new(
        logdev: Arc<LogDev>,
        meta: Arc<MetaBlkMgr>,
        recovered_registry: Option<(Bytes, MetaCookie)>,
    ) -> Result<Arc<Self>> {
        let registry = match recovered_registry {
            Some((blob, cookie)) => Registry {
                ids: Registry::from_bytes(&blob)?,
                cookie: Some(cookie),
            },
            None => Registry {
                ids: BTreeSet::new(),
                cookie: None,
            },
        };

        logdev.clone().start_flusher();
        Ok(Arc::new(Self {
            logdev,
            meta,
            registry: Mutex::new(registry),
        }))
    }

    /// The shared log device
    pub fn logdev(&self) -> &Arc<LogDev> {
        &self.logdev
    }

    fn persist_registry(&self, registry: &mut Registry) -> Result<()> {
        let blob = registry.to_bytes();
        match registry.cookie {
            Some(cookie) => self.meta.update_meta_blk(cookie, blob),
            None => {
                registry.cookie = Some(self.meta.write_meta_blk(LOGSTORE_META_NAME, blob)?);
                Ok(())
            }
        }
    }

    /// Create a new log store with the next free id
    pub fn create_log_store(&self, append_mode: bool) -> Result<LogStore> {
        let mut registry = self.registry.lock();
        let id = registry.ids.last().map_or(0, |last| last + 1);
        registry.ids.insert(id);
        self.persist_registry(&mut registry)?;
        drop(registry);

        let core = LogStoreCore::new(id, append_mode, 0);
        self.logdev.register_store(id, core.clone());
        info!(store = id, append_mode, "log store created");
        Ok(LogStore::new(core, self.logdev.clone()))
    }

    /// Open a previously created log store. Register replay callbacks
    /// on the returned handle before calling [`LogStoreService::replay`].
    pub fn open_log_store(&self, id: LogStoreId, append_mode: bool) -> Result<LogStore> {
        if !self.registry.lock().ids.contains(&id) {
            return Err(Error::out_of_range(format!("unknown log store {id}")));
        }
        let core = LogStoreCore::new(id, append_mode, 0);
        self.logdev.register_store(id, core.clone());
        Ok(LogStore::new(core, self.logdev.clone()))
    }

    /// Ids of every persisted log store
    pub fn store_ids(&self) -> Vec<LogStoreId> {
        self.registry.lock().ids.iter().copied().collect()
    }

    /// Destroy a log store's registration; its device space is
    /// reclaimed as truncation advances past it
    pub fn remove_log_store(&self, id: LogStoreId) -> Result<()> {
        let mut registry = self.registry.lock();
        if !registry.ids.remove(&id) {
            return Err(Error::out_of_range(format!("unknown log store {id}")));
        }
        self.persist_registry(&mut registry)?;
        drop(registry);
        self.logdev.release(id);
        info!(store = id, "log store removed");
        Ok(())
    }

    /// Replay every unreclaimed record to its opened store, then fire
    /// each store's replay-done callback
    pub fn replay(&self) -> Result<()> {
        self.logdev.recover()?;
        for core in self.logdev.registered_stores() {
            core.finish_replay();
        }
        Ok(())
    }

    /// One round of the global safe-truncation protocol: min of every
    /// store's boundary, device truncate, then per-store confirmation
    pub fn device_truncate(&self) -> Result<Option<LogDevKey>> {
        self.logdev.run_truncation_round()
    }

    /// Convenience: in-memory truncate one store and run a device round
    pub fn truncate_store(&self, store: &LogStore, upto: Lsn) -> Result<Option<LogDevKey>> {
        store.truncate(upto, true)?;
        self.device_truncate()
    }

    /// Quiesce the device: stop the flusher and flush the open batch
    pub fn shutdown(&self) -> Result<()> {
        self.logdev.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_roundtrip() {
        let registry = Registry {
            ids: [0u32, 1, 5].into_iter().collect(),
            cookie: None,
        };
        let blob = registry.to_bytes();
        let parsed = Registry::from_bytes(&blob).unwrap();
        assert_eq!(parsed, [0u32, 1, 5].into_iter().collect::<BTreeSet<_>>());
    }

    #[test]
    fn test_registry_rejects_truncated_blob() {
        let registry = Registry {
            ids: [0u32, 1].into_iter().collect(),
            cookie: None,
        };
        let blob = registry.to_bytes();
        assert!(Registry::from_bytes(&blob[..5]).is_err());
    }
}
