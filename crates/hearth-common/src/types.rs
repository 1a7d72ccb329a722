//! Core type definitions for hearth
//!
//! Identifiers and small value types shared across the device manager,
//! block stores and the log service.

use crate::error::{Error, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric identifier of a virtual device within one engine instance
pub type VdevId = u32;

/// Numeric identifier of a log store within one log device
pub type LogStoreId = u32;

/// Identifier for a contiguous run of pages within a vdev.
///
/// A `BlkId` is valid only between the allocation that produced it and
/// the corresponding free.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlkId {
    /// Chunk index within the vdev
    pub chunk: u32,
    /// Page offset within the chunk
    pub offset: u32,
    /// Number of contiguous pages
    pub nblks: u32,
}

impl BlkId {
    /// Encoded size in bytes
    pub const ENCODED_SIZE: usize = 12;

    /// The invalid sentinel
    pub const INVALID: BlkId = BlkId {
        chunk: u32::MAX,
        offset: u32::MAX,
        nblks: 0,
    };

    /// Create a new block id
    #[must_use]
    pub const fn new(chunk: u32, offset: u32, nblks: u32) -> Self {
        Self {
            chunk,
            offset,
            nblks,
        }
    }

    /// Whether this id refers to an allocated run
    #[must_use]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID && self.nblks > 0
    }

    /// Serialize to fixed-width little-endian bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..4].copy_from_slice(&self.chunk.to_le_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.nblks.to_le_bytes());
        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return Err(Error::corrupt("blkid too small"));
        }
        Ok(Self {
            chunk: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            offset: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            nblks: u32::from_le_bytes(data[8..12].try_into().unwrap()),
        })
    }
}

impl fmt::Debug for BlkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "BlkId({}.{}+{})", self.chunk, self.offset, self.nblks)
        } else {
            write!(f, "BlkId(invalid)")
        }
    }
}

impl fmt::Display for BlkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}+{}", self.chunk, self.offset, self.nblks)
    }
}

/// Typed variant decoded from a vdev's opaque context blob.
///
/// The first four bytes of the blob tag the variant; reattach decodes it
/// once and dispatches to the matching block-store constructor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum VdevKind {
    /// Bulk data store (writeback cached)
    #[display("data")]
    Data,
    /// Index store (read-modify-writeback cached)
    #[display("index")]
    Index,
    /// Deprecated superblock store; carries the application boot record id
    #[display("superblock")]
    Superblock { root: BlkId },
    /// Backing store of the log device
    #[display("logdev")]
    LogDev,
    /// Backing store of the meta-block manager
    #[display("meta")]
    Meta,
}

impl VdevKind {
    /// Wire tag of the variant
    #[must_use]
    pub fn tag(&self) -> u32 {
        match self {
            Self::Data => 1,
            Self::Index => 2,
            Self::Superblock { .. } => 3,
            Self::LogDev => 4,
            Self::Meta => 5,
        }
    }

    /// Encode as a context blob
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + BlkId::ENCODED_SIZE);
        buf.extend_from_slice(&self.tag().to_le_bytes());
        if let Self::Superblock { root } = self {
            buf.extend_from_slice(&root.to_bytes());
        }
        buf
    }

    /// Decode from a context blob
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corrupt("vdev context blob too small"));
        }
        let tag = u32::from_le_bytes(data[0..4].try_into().unwrap());
        match tag {
            1 => Ok(Self::Data),
            2 => Ok(Self::Index),
            3 => {
                let root = BlkId::from_bytes(&data[4..])?;
                Ok(Self::Superblock { root })
            }
            4 => Ok(Self::LogDev),
            5 => Ok(Self::Meta),
            other => Err(Error::corrupt(format!("unknown vdev kind tag {other}"))),
        }
    }
}

/// Attributes reported by a raw drive.
///
/// All raw devices behind one engine instance must report identical
/// attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveAttributes {
    /// Physical page size (unit of layout rounding)
    pub phys_page_size: u32,
    /// Atomically written physical page size
    pub atomic_phys_page_size: u32,
    /// Required alignment for direct I/O transfers
    pub align_size: u32,
    /// Optimal I/O size for throughput
    pub optimal_io_size: u32,
}

impl Default for DriveAttributes {
    fn default() -> Self {
        Self {
            phys_page_size: 4096,
            atomic_phys_page_size: 4096,
            align_size: 512,
            optimal_io_size: 1024 * 1024,
        }
    }
}

impl DriveAttributes {
    /// Encoded size in bytes
    pub const ENCODED_SIZE: usize = 16;

    /// Serialize to fixed-width little-endian bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..4].copy_from_slice(&self.phys_page_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.atomic_phys_page_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.align_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.optimal_io_size.to_le_bytes());
        buf
    }

    /// Parse from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return Err(Error::corrupt("drive attributes too small"));
        }
        Ok(Self {
            phys_page_size: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            atomic_phys_page_size: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            align_size: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            optimal_io_size: u32::from_le_bytes(data[12..16].try_into().unwrap()),
        })
    }
}

/// Hints for contiguous block allocation
#[derive(Clone, Copy, Debug, Default)]
pub struct BlkAllocHints {
    /// Preferred device to place the run on
    pub preferred_dev: Option<u32>,
    /// Desired data temperature (advisory)
    pub temperature: Option<u8>,
    /// Whether the allocation must be a single contiguous run
    pub contiguous: bool,
}

/// Capacity snapshot reported by the engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapacityAttrs {
    /// Bytes allocated from the data store
    pub used_data_size: u64,
    /// Bytes allocated from the index store
    pub used_index_size: u64,
    /// Sum of data and index usage
    pub used_total_size: u64,
    /// Combined size of the data and index stores
    pub initial_total_size: u64,
}

/// Round a value up to the nearest multiple of `align`
#[inline]
#[must_use]
pub const fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blkid_roundtrip() {
        let id = BlkId::new(3, 128, 16);
        let parsed = BlkId::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(id, parsed);
        assert!(id.is_valid());
    }

    #[test]
    fn test_blkid_invalid_sentinel() {
        assert!(!BlkId::INVALID.is_valid());
        let parsed = BlkId::from_bytes(&BlkId::INVALID.to_bytes()).unwrap();
        assert!(!parsed.is_valid());
    }

    #[test]
    fn test_vdev_kind_roundtrip() {
        for kind in [
            VdevKind::Data,
            VdevKind::Index,
            VdevKind::Superblock {
                root: BlkId::new(0, 7, 1),
            },
            VdevKind::LogDev,
            VdevKind::Meta,
        ] {
            let blob = kind.encode();
            assert_eq!(VdevKind::decode(&blob).unwrap(), kind);
        }
    }

    #[test]
    fn test_vdev_kind_rejects_unknown_tag() {
        assert!(VdevKind::decode(&9u32.to_le_bytes()).is_err());
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }
}
