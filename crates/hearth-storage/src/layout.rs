//! On-device layout definitions
//!
//! Every raw device in a fleet carries:
//! ```text
//! +------------------+  offset 0
//! |  Fleet header    |  4KB - magic, version, fleet id, device index
//! +------------------+  offset 4096
//! |  Vdev catalog    |  16 x 1KB vdev records (devices 0 and 1 only)
//! +------------------+  offset 20480
//! |  Vdev data area  |  chunks, striped round-robin across devices
//! +------------------+
//! ```
//!
//! The catalog is duplicated to `min(#devices, 2)` devices; the header
//! is written to every device so reattach can recover device ordering.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hearth_common::{compute_crc32c, DriveAttributes, Error, Result, VdevId};
use uuid::Uuid;

/// Magic number for the hearth fleet header
pub const FLEET_MAGIC: [u8; 8] = *b"HRTHFLT\0";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Fleet header size (one physical page)
pub const FLEET_HEADER_SIZE: u64 = 4096;

/// Maximum number of vdevs per fleet
pub const MAX_VDEVS: usize = 16;

/// Size of one serialized vdev record slot
pub const VDEV_RECORD_SIZE: u64 = 1024;

/// Ceiling on a vdev's opaque context blob
pub const VDEV_CONTEXT_CEILING: usize = 512;

/// Size of the vdev catalog region
pub const CATALOG_SIZE: u64 = MAX_VDEVS as u64 * VDEV_RECORD_SIZE;

/// Offset where the vdev data area begins on every device
pub const DATA_AREA_OFFSET: u64 = FLEET_HEADER_SIZE + CATALOG_SIZE;

/// Minimum usable device size
pub const MIN_DEVICE_SIZE: u64 = 16 * 1024 * 1024;

/// Fleet header stored at the beginning of each raw device
#[derive(Clone, Debug)]
pub struct FleetHeader {
    /// Magic number for format identification
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Identifier shared by every device of the fleet
    pub fleet_id: Uuid,
    /// Position of this device within the fleet
    pub device_index: u32,
    /// Total number of devices in the fleet
    pub device_count: u32,
    /// Drive attributes recorded at format time
    pub attrs: DriveAttributes,
    /// Creation timestamp (Unix epoch seconds)
    pub created_at: u64,
    /// Checksum of the header (excluding this field)
    pub checksum: u32,
}

impl FleetHeader {
    /// magic(8) + version(4) + fleet_id(16) + device_index(4) +
    /// device_count(4) + attrs(16) + created_at(8) = 60
    const CHECKSUM_OFFSET: usize = 60;

    /// Create a header for a freshly formatted device
    pub fn new(fleet_id: Uuid, device_index: u32, device_count: u32, attrs: DriveAttributes) -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut hdr = Self {
            magic: FLEET_MAGIC,
            version: FORMAT_VERSION,
            fleet_id,
            device_index,
            device_count,
            attrs,
            created_at: now,
            checksum: 0,
        };
        hdr.checksum = hdr.compute_checksum();
        hdr
    }

    /// Serialize to a full header page
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FLEET_HEADER_SIZE as usize);
        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_slice(self.fleet_id.as_bytes());
        buf.put_u32_le(self.device_index);
        buf.put_u32_le(self.device_count);
        buf.put_slice(&self.attrs.to_bytes());
        buf.put_u64_le(self.created_at);
        buf.put_u32_le(self.checksum);
        buf.resize(FLEET_HEADER_SIZE as usize, 0);
        buf.freeze()
    }

    /// Parse a header page
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::CHECKSUM_OFFSET + 4 {
            return Err(Error::corrupt("fleet header too small"));
        }

        let mut buf = &data[..];

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != FLEET_MAGIC {
            return Err(Error::corrupt("invalid fleet header magic"));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported format version {version}"
            )));
        }

        let mut id_bytes = [0u8; 16];
        buf.copy_to_slice(&mut id_bytes);
        let fleet_id = Uuid::from_bytes(id_bytes);

        let device_index = buf.get_u32_le();
        let device_count = buf.get_u32_le();

        let mut attr_bytes = [0u8; DriveAttributes::ENCODED_SIZE];
        buf.copy_to_slice(&mut attr_bytes);
        let attrs = DriveAttributes::from_bytes(&attr_bytes)?;

        let created_at = buf.get_u64_le();
        let checksum = buf.get_u32_le();

        let hdr = Self {
            magic,
            version,
            fleet_id,
            device_index,
            device_count,
            attrs,
            created_at,
            checksum,
        };

        if hdr.compute_checksum() != checksum {
            return Err(Error::corrupt("fleet header checksum mismatch"));
        }

        Ok(hdr)
    }

    /// Check whether a raw page looks like a hearth header at all
    pub fn is_formatted(data: &[u8]) -> bool {
        data.len() >= 8 && data[..8] == FLEET_MAGIC
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        compute_crc32c(&bytes[..Self::CHECKSUM_OFFSET])
    }
}

/// Persistent descriptor for one virtual device
#[derive(Clone, Debug)]
pub struct VdevRecord {
    /// Numeric vdev identifier; doubles as the catalog slot
    pub id: VdevId,
    /// Wire tag of the vdev kind (copy of the context blob tag)
    pub kind_tag: u32,
    /// Total vdev capacity in bytes (whole chunks)
    pub size: u64,
    /// Per-device offset where this vdev's chunk stripe begins
    pub start_offset: u64,
    /// Page size exposed by this vdev
    pub page_size: u32,
    /// Size of one chunk in bytes
    pub chunk_size: u64,
    /// Total number of chunks across all devices
    pub num_chunks: u32,
    /// Chunks placed on each device
    pub chunks_per_dev: u32,
    /// Number of mirror copies per chunk
    pub mirrors: u8,
    /// Whether an unrecoverable device error poisoned this vdev
    pub failed: bool,
    /// Opaque context blob interpreted by the engine facade
    pub context: Vec<u8>,
}

impl VdevRecord {
    /// id(4) + kind_tag(4) + size(8) + start_offset(8) + page_size(4) +
    /// chunk_size(8) + num_chunks(4) + chunks_per_dev(4) + mirrors(1) +
    /// failed(1) + context_len(2) = 48, then the context area
    const CHECKSUM_OFFSET: usize = 48 + VDEV_CONTEXT_CEILING;

    /// Serialize to one catalog slot
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(VDEV_RECORD_SIZE as usize);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.kind_tag);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.start_offset);
        buf.put_u32_le(self.page_size);
        buf.put_u64_le(self.chunk_size);
        buf.put_u32_le(self.num_chunks);
        buf.put_u32_le(self.chunks_per_dev);
        buf.put_u8(self.mirrors);
        buf.put_u8(u8::from(self.failed));
        buf.put_u16_le(self.context.len() as u16);
        buf.put_slice(&self.context);
        buf.resize(Self::CHECKSUM_OFFSET, 0);
        let crc = compute_crc32c(&buf[..Self::CHECKSUM_OFFSET]);
        buf.put_u32_le(crc);
        buf.resize(VDEV_RECORD_SIZE as usize, 0);
        buf.freeze()
    }

    /// Parse one catalog slot
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::CHECKSUM_OFFSET + 4 {
            return Err(Error::corrupt("vdev record too small"));
        }

        let stored_crc = u32::from_le_bytes(
            data[Self::CHECKSUM_OFFSET..Self::CHECKSUM_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        if compute_crc32c(&data[..Self::CHECKSUM_OFFSET]) != stored_crc {
            return Err(Error::corrupt("vdev record checksum mismatch"));
        }

        let mut buf = &data[..];
        let id = buf.get_u32_le();
        let kind_tag = buf.get_u32_le();
        let size = buf.get_u64_le();
        let start_offset = buf.get_u64_le();
        let page_size = buf.get_u32_le();
        let chunk_size = buf.get_u64_le();
        let num_chunks = buf.get_u32_le();
        let chunks_per_dev = buf.get_u32_le();
        let mirrors = buf.get_u8();
        let failed = buf.get_u8() != 0;
        let context_len = buf.get_u16_le() as usize;
        if context_len > VDEV_CONTEXT_CEILING {
            return Err(Error::corrupt("vdev context blob exceeds ceiling"));
        }
        let context = buf[..context_len].to_vec();

        Ok(Self {
            id,
            kind_tag,
            size,
            start_offset,
            page_size,
            chunk_size,
            num_chunks,
            chunks_per_dev,
            mirrors,
            failed,
            context,
        })
    }

    /// Whether a catalog slot is occupied
    pub fn slot_in_use(data: &[u8]) -> bool {
        // An empty slot is all zeros; a used slot never checksums to zero
        // with a zero body.
        data.iter().any(|&b| b != 0)
    }

    /// Number of pages in one chunk
    pub fn pages_per_chunk(&self) -> u32 {
        (self.chunk_size / u64::from(self.page_size)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_header_roundtrip() {
        let hdr = FleetHeader::new(Uuid::new_v4(), 1, 2, DriveAttributes::default());
        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), FLEET_HEADER_SIZE as usize);

        let parsed = FleetHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.fleet_id, hdr.fleet_id);
        assert_eq!(parsed.device_index, 1);
        assert_eq!(parsed.device_count, 2);
        assert_eq!(parsed.attrs, hdr.attrs);
    }

    #[test]
    fn test_fleet_header_rejects_corruption() {
        let hdr = FleetHeader::new(Uuid::new_v4(), 0, 1, DriveAttributes::default());
        let mut bytes = hdr.to_bytes().to_vec();
        bytes[20] ^= 0xFF;
        assert!(FleetHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_blank_page_is_unformatted() {
        assert!(!FleetHeader::is_formatted(&[0u8; 4096]));
    }

    #[test]
    fn test_vdev_record_roundtrip() {
        let rec = VdevRecord {
            id: 2,
            kind_tag: 1,
            size: 64 << 20,
            start_offset: DATA_AREA_OFFSET,
            page_size: 4096,
            chunk_size: 8 << 20,
            num_chunks: 8,
            chunks_per_dev: 4,
            mirrors: 0,
            failed: false,
            context: vec![1, 0, 0, 0],
        };
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), VDEV_RECORD_SIZE as usize);
        assert!(VdevRecord::slot_in_use(&bytes));

        let parsed = VdevRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id, 2);
        assert_eq!(parsed.size, 64 << 20);
        assert_eq!(parsed.context, vec![1, 0, 0, 0]);
        assert_eq!(parsed.pages_per_chunk(), 2048);
    }

    #[test]
    fn test_empty_slot_not_in_use() {
        assert!(!VdevRecord::slot_in_use(&[0u8; VDEV_RECORD_SIZE as usize]));
    }
}
