//! Device management
//!
//! The device manager exclusively owns the raw devices of one engine
//! instance. It formats a blank fleet on first boot, rediscovers an
//! initialized fleet on reattach, carves capacity into vdevs and
//! persists the vdev catalog redundantly.

use crate::layout::{
    FleetHeader, VdevRecord, CATALOG_SIZE, DATA_AREA_OFFSET, FLEET_HEADER_SIZE, MAX_VDEVS,
    MIN_DEVICE_SIZE, VDEV_CONTEXT_CEILING, VDEV_RECORD_SIZE,
};
use crate::raw_io::RawFile;
use hearth_common::{round_up, DeviceType, DriveAttributes, Error, Result, VdevId};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};
use uuid::Uuid;

/// Default chunk size for newly registered vdevs
const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Hook invoked out-of-band when a vdev is poisoned by a device error
pub type VdevErrorHook = std::sync::Arc<dyn Fn(VdevId) + Send + Sync>;

/// Per-manager I/O statistics
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

struct CatalogState {
    slots: Vec<Option<VdevRecord>>,
    /// Next free byte within each device's data area (uniform across
    /// devices because vdevs stripe at the same per-device offset)
    cursor: u64,
}

/// Owner of the raw devices behind one engine instance
pub struct DeviceManager {
    device_type: DeviceType,
    attrs: DriveAttributes,
    devices: Vec<RawFile>,
    fleet_id: Uuid,
    catalog: Mutex<CatalogState>,
    data_area_per_dev: u64,
    first_time_boot: bool,
    stats: DeviceStats,
    error_hook: RwLock<Option<VdevErrorHook>>,
}

impl DeviceManager {
    /// Create an empty manager; call [`DeviceManager::add_devices`]
    /// before anything else.
    pub fn new(attrs: DriveAttributes, device_type: DeviceType) -> Self {
        Self {
            device_type,
            attrs,
            devices: Vec::new(),
            fleet_id: Uuid::nil(),
            catalog: Mutex::new(CatalogState {
                slots: vec![None; MAX_VDEVS],
                cursor: 0,
            }),
            data_area_per_dev: 0,
            first_time_boot: false,
            stats: DeviceStats::default(),
            error_hook: RwLock::new(None),
        }
    }

    /// Install the out-of-band vdev error hook
    pub fn set_error_hook(&self, hook: VdevErrorHook) {
        *self.error_hook.write() = Some(hook);
    }

    /// Open every device and either detect a previously initialized
    /// fleet (returns `false`) or write a fresh layout (returns `true`).
    /// With `allow_format` unset, a blank fleet is an error instead of
    /// being formatted.
    pub fn add_devices(&mut self, paths: &[PathBuf], allow_format: bool) -> Result<bool> {
        if paths.is_empty() {
            return Err(Error::invalid_argument("no devices given"));
        }

        let mut opened = Vec::with_capacity(paths.len());
        for path in paths {
            let file = RawFile::open(path, self.device_type, self.attrs.align_size)?;
            if file.size() < MIN_DEVICE_SIZE {
                return Err(Error::InsufficientCapacity {
                    required: MIN_DEVICE_SIZE,
                    available: file.size(),
                });
            }
            opened.push(file);
        }

        let mut headers = Vec::with_capacity(opened.len());
        for file in &opened {
            let mut page = vec![0u8; FLEET_HEADER_SIZE as usize];
            file.read_at(0, &mut page)?;
            if FleetHeader::is_formatted(&page) {
                headers.push(Some(FleetHeader::from_bytes(&page)?));
            } else {
                headers.push(None);
            }
        }

        let formatted = headers.iter().filter(|h| h.is_some()).count();
        let first_time = if formatted == 0 {
            if !allow_format {
                return Err(Error::InitFailed(
                    "blank fleet and formatting is not allowed".into(),
                ));
            }
            self.format_fleet(&opened)?;
            self.devices = opened;
            true
        } else if formatted == opened.len() {
            self.devices = self.attach_fleet(opened, headers)?;
            false
        } else {
            return Err(Error::IncompatibleDrives(
                "mix of initialized and blank devices".into(),
            ));
        };

        let min_size = self.devices.iter().map(RawFile::size).min().unwrap();
        self.data_area_per_dev = min_size - DATA_AREA_OFFSET;
        self.first_time_boot = first_time;

        info!(
            devices = self.devices.len(),
            first_time,
            capacity = self.total_capacity(),
            "device fleet attached"
        );
        Ok(first_time)
    }

    fn format_fleet(&mut self, devices: &[RawFile]) -> Result<()> {
        self.fleet_id = Uuid::new_v4();
        for (idx, file) in devices.iter().enumerate() {
            let hdr = FleetHeader::new(self.fleet_id, idx as u32, devices.len() as u32, self.attrs);
            file.write_at(0, &hdr.to_bytes())?;
        }
        // Blank catalog on the catalog-bearing devices
        let zeros = vec![0u8; CATALOG_SIZE as usize];
        for file in devices.iter().take(2) {
            file.write_at(FLEET_HEADER_SIZE, &zeros)?;
        }
        for file in devices {
            file.sync()?;
        }
        Ok(())
    }

    fn attach_fleet(
        &mut self,
        opened: Vec<RawFile>,
        headers: Vec<Option<FleetHeader>>,
    ) -> Result<Vec<RawFile>> {
        let headers: Vec<FleetHeader> = headers.into_iter().map(Option::unwrap).collect();

        let fleet_id = headers[0].fleet_id;
        for hdr in &headers {
            if hdr.fleet_id != fleet_id {
                return Err(Error::IncompatibleDrives(
                    "devices belong to different fleets".into(),
                ));
            }
            if hdr.device_count as usize != opened.len() {
                return Err(Error::IncompatibleDrives(format!(
                    "fleet was formatted with {} devices, {} given",
                    hdr.device_count,
                    opened.len()
                )));
            }
            debug_assert_eq!(hdr.attrs, self.attrs, "divergent drive attributes");
            if hdr.attrs != self.attrs {
                return Err(Error::IncompatibleDrives(
                    "drive attributes diverge from the formatted fleet".into(),
                ));
            }
        }
        self.fleet_id = fleet_id;

        // Restore fleet ordering from the per-device index
        let mut ordered: Vec<Option<RawFile>> = (0..opened.len()).map(|_| None).collect();
        for (file, hdr) in opened.into_iter().zip(headers) {
            let idx = hdr.device_index as usize;
            if idx >= ordered.len() || ordered[idx].is_some() {
                return Err(Error::corrupt("duplicate or out-of-range device index"));
            }
            ordered[idx] = Some(file);
        }
        let devices: Vec<RawFile> = ordered.into_iter().map(Option::unwrap).collect();

        self.load_catalog(&devices)?;
        Ok(devices)
    }

    fn load_catalog(&mut self, devices: &[RawFile]) -> Result<()> {
        let copies = devices.len().min(2);
        let mut last_err = None;
        for (idx, file) in devices.iter().take(copies).enumerate() {
            match Self::read_catalog(file) {
                Ok(slots) => {
                    if idx > 0 {
                        warn!("primary vdev catalog unreadable, recovered from mirror");
                    }
                    let cursor = slots
                        .iter()
                        .flatten()
                        .map(|r| {
                            r.start_offset - DATA_AREA_OFFSET
                                + u64::from(r.chunks_per_dev) * r.chunk_size
                        })
                        .max()
                        .unwrap_or(0);
                    let mut catalog = self.catalog.lock();
                    catalog.slots = slots;
                    catalog.cursor = cursor;
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::corrupt("vdev catalog unreadable")))
    }

    fn read_catalog(file: &RawFile) -> Result<Vec<Option<VdevRecord>>> {
        let mut buf = vec![0u8; CATALOG_SIZE as usize];
        file.read_at(FLEET_HEADER_SIZE, &mut buf)?;

        let mut slots = Vec::with_capacity(MAX_VDEVS);
        for slot in 0..MAX_VDEVS {
            let chunk = &buf[slot * VDEV_RECORD_SIZE as usize..(slot + 1) * VDEV_RECORD_SIZE as usize];
            if VdevRecord::slot_in_use(chunk) {
                slots.push(Some(VdevRecord::from_bytes(chunk)?));
            } else {
                slots.push(None);
            }
        }
        Ok(slots)
    }

    /// Record a new vdev, reserving capacity and persisting the record
    /// redundantly.
    pub fn register_vdev(
        &self,
        size: u64,
        page_size: u32,
        mirrors: u8,
        context: &[u8],
    ) -> Result<VdevRecord> {
        if context.len() > VDEV_CONTEXT_CEILING {
            return Err(Error::invalid_argument("vdev context blob exceeds ceiling"));
        }
        if size == 0 || page_size == 0 {
            return Err(Error::invalid_argument("zero vdev size or page size"));
        }
        if self.devices.is_empty() {
            return Err(Error::storage("no devices attached"));
        }

        // Aim for several chunks per device so per-device rounding
        // stays a small fraction of the requested size.
        let ndev = self.devices.len() as u64;
        let chunk_size = round_up(
            DEFAULT_CHUNK_SIZE
                .min(size.div_ceil(ndev * 8))
                .max(u64::from(page_size)),
            u64::from(page_size),
        );
        let num_chunks = size.div_ceil(chunk_size) as u32;
        // Mirrored vdevs place every chunk at the same slot on every
        // device; unmirrored vdevs stripe chunks round-robin.
        let chunks_per_dev = if mirrors > 0 {
            num_chunks
        } else {
            num_chunks.div_ceil(ndev as u32)
        };
        let per_dev_bytes = u64::from(chunks_per_dev) * chunk_size;

        let mut catalog = self.catalog.lock();
        if catalog.cursor + per_dev_bytes > self.data_area_per_dev {
            return Err(Error::InsufficientCapacity {
                required: per_dev_bytes,
                available: self.data_area_per_dev - catalog.cursor,
            });
        }

        let slot = catalog
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| Error::storage("vdev catalog full"))?;

        let record = VdevRecord {
            id: slot as VdevId,
            kind_tag: context
                .get(..4)
                .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                .unwrap_or(0),
            size: u64::from(num_chunks) * chunk_size,
            start_offset: DATA_AREA_OFFSET + catalog.cursor,
            page_size,
            chunk_size,
            num_chunks,
            chunks_per_dev,
            mirrors,
            failed: false,
            context: context.to_vec(),
        };

        catalog.cursor += per_dev_bytes;
        catalog.slots[slot] = Some(record.clone());
        self.persist_catalog(&catalog.slots)?;

        info!(
            vdev = record.id,
            kind = record.kind_tag,
            size = record.size,
            chunks = num_chunks,
            "registered vdev"
        );
        Ok(record)
    }

    /// Invoke `sink` once per persisted vdev, in catalog order
    pub fn enumerate_vdevs(&self, mut sink: impl FnMut(&VdevRecord) -> Result<()>) -> Result<()> {
        let catalog = self.catalog.lock();
        for record in catalog.slots.iter().flatten() {
            sink(record)?;
        }
        Ok(())
    }

    /// Atomically rewrite a vdev's opaque context blob
    pub fn update_vdev_context(&self, id: VdevId, context: &[u8]) -> Result<()> {
        if context.len() > VDEV_CONTEXT_CEILING {
            return Err(Error::invalid_argument("vdev context blob exceeds ceiling"));
        }
        let mut catalog = self.catalog.lock();
        let record = catalog
            .slots
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::invalid_argument(format!("unknown vdev {id}")))?;
        record.context = context.to_vec();
        self.persist_catalog(&catalog.slots)
    }

    /// Mark a vdev failed, persist the flag and fire the error hook
    pub fn mark_vdev_failed(&self, id: VdevId) {
        {
            let mut catalog = self.catalog.lock();
            if let Some(record) = catalog.slots.get_mut(id as usize).and_then(Option::as_mut) {
                if record.failed {
                    return;
                }
                record.failed = true;
            } else {
                return;
            }
            if let Err(e) = self.persist_catalog(&catalog.slots) {
                warn!(vdev = id, "failed to persist vdev failure flag: {e}");
            }
        }
        warn!(vdev = id, "vdev marked failed");
        if let Some(hook) = self.error_hook.read().clone() {
            hook(id);
        }
    }

    fn persist_catalog(&self, slots: &[Option<VdevRecord>]) -> Result<()> {
        let mut buf = vec![0u8; CATALOG_SIZE as usize];
        for (slot, record) in slots.iter().enumerate() {
            if let Some(record) = record {
                let bytes = record.to_bytes();
                buf[slot * VDEV_RECORD_SIZE as usize..(slot + 1) * VDEV_RECORD_SIZE as usize]
                    .copy_from_slice(&bytes);
            }
        }
        for file in self.devices.iter().take(2) {
            file.write_at(FLEET_HEADER_SIZE, &buf)?;
            file.sync()?;
        }
        Ok(())
    }

    /// Read from one device, updating statistics
    pub fn read_at(&self, dev: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self
            .devices
            .get(dev as usize)
            .ok_or_else(|| Error::invalid_argument(format!("unknown device {dev}")))?;
        file.read_at(offset, buf)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write to one device, updating statistics
    pub fn write_at(&self, dev: u32, offset: u64, data: &[u8]) -> Result<()> {
        let file = self
            .devices
            .get(dev as usize)
            .ok_or_else(|| Error::invalid_argument(format!("unknown device {dev}")))?;
        file.write_at(offset, data)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Sync one device
    pub fn sync_device(&self, dev: u32) -> Result<()> {
        self.devices
            .get(dev as usize)
            .ok_or_else(|| Error::invalid_argument(format!("unknown device {dev}")))?
            .sync_data()
    }

    /// Sync every device
    pub fn sync_all(&self) -> Result<()> {
        for file in &self.devices {
            file.sync()?;
        }
        Ok(())
    }

    /// Usable capacity across all devices (vdev data areas only)
    pub fn total_capacity(&self) -> u64 {
        self.data_area_per_dev * self.devices.len() as u64
    }

    /// Number of devices in the fleet
    pub fn num_devices(&self) -> u32 {
        self.devices.len() as u32
    }

    /// Whether `add_devices` formatted a fresh fleet
    pub fn is_first_time_boot(&self) -> bool {
        self.first_time_boot
    }

    /// Drive attributes shared by the fleet
    pub fn attrs(&self) -> DriveAttributes {
        self.attrs
    }

    /// Fleet identifier
    pub fn fleet_id(&self) -> Uuid {
        self.fleet_id
    }

    /// I/O statistics
    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Flush the catalog and sync all devices
    pub fn close(&self) -> Result<()> {
        let catalog = self.catalog.lock();
        self.persist_catalog(&catalog.slots)?;
        drop(catalog);
        self.sync_all()?;
        info!("device fleet closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_devices(dir: &TempDir, count: usize, size: u64) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.path().join(format!("dev{i}"));
                RawFile::create(&path, size).unwrap();
                path
            })
            .collect()
    }

    fn new_manager() -> DeviceManager {
        DeviceManager::new(DriveAttributes::default(), DeviceType::File)
    }

    #[test]
    fn test_first_boot_then_reattach() {
        let dir = TempDir::new().unwrap();
        let paths = make_devices(&dir, 2, 32 << 20);

        let fleet_id = {
            let mut mgr = new_manager();
            assert!(mgr.add_devices(&paths, true).unwrap());
            assert!(mgr.is_first_time_boot());
            assert!(mgr.total_capacity() > 0);
            mgr.close().unwrap();
            mgr.fleet_id()
        };

        let mut mgr = new_manager();
        assert!(!mgr.add_devices(&paths, true).unwrap());
        assert_eq!(mgr.fleet_id(), fleet_id);
    }

    #[test]
    fn test_vdev_registration_survives_reattach() {
        let dir = TempDir::new().unwrap();
        let paths = make_devices(&dir, 2, 32 << 20);

        {
            let mut mgr = new_manager();
            mgr.add_devices(&paths, true).unwrap();
            let rec = mgr.register_vdev(4 << 20, 4096, 0, &1u32.to_le_bytes()).unwrap();
            assert_eq!(rec.id, 0);
            assert!(rec.size >= 4 << 20);
            mgr.close().unwrap();
        }

        let mut mgr = new_manager();
        mgr.add_devices(&paths, true).unwrap();
        let mut found = Vec::new();
        mgr.enumerate_vdevs(|rec| {
            found.push((rec.id, rec.size, rec.kind_tag));
            Ok(())
        })
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].2, 1);

        // The cursor was restored; the next vdev lands after the first
        let rec2 = mgr.register_vdev(4 << 20, 4096, 0, &4u32.to_le_bytes()).unwrap();
        assert_eq!(rec2.id, 1);
        assert!(rec2.start_offset > DATA_AREA_OFFSET);
    }

    #[test]
    fn test_mixed_fleet_rejected() {
        let dir = TempDir::new().unwrap();
        let paths = make_devices(&dir, 2, 32 << 20);

        {
            let mut mgr = new_manager();
            mgr.add_devices(&paths[..1].to_vec(), true).unwrap();
        }

        let mut mgr = new_manager();
        let err = mgr.add_devices(&paths, true).unwrap_err();
        assert!(matches!(err, Error::IncompatibleDrives(_)));
    }

    #[test]
    fn test_insufficient_capacity() {
        let dir = TempDir::new().unwrap();
        let paths = make_devices(&dir, 1, 32 << 20);

        let mut mgr = new_manager();
        mgr.add_devices(&paths, true).unwrap();
        let err = mgr.register_vdev(1 << 40, 4096, 0, &[]).unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_failed_flag_persists_and_fires_hook() {
        let dir = TempDir::new().unwrap();
        let paths = make_devices(&dir, 1, 32 << 20);

        let fired = Arc::new(std::sync::atomic::AtomicU32::new(u32::MAX));
        {
            let mut mgr = new_manager();
            mgr.add_devices(&paths, true).unwrap();
            mgr.register_vdev(4 << 20, 4096, 0, &2u32.to_le_bytes()).unwrap();
            let fired2 = fired.clone();
            mgr.set_error_hook(Arc::new(move |id| {
                fired2.store(id, Ordering::SeqCst);
            }));
            mgr.mark_vdev_failed(0);
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        }

        let mut mgr = new_manager();
        mgr.add_devices(&paths, true).unwrap();
        let mut failed = false;
        mgr.enumerate_vdevs(|rec| {
            failed = rec.failed;
            Ok(())
        })
        .unwrap();
        assert!(failed);
    }
}
