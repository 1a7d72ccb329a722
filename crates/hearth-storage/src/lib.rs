//! Hearth Storage Engine - devices, vdevs and block stores
//!
//! This crate implements the block-store substrate of hearth:
//! - Raw device access (buffered for files, O_DIRECT for block devices)
//! - Partitioning of raw capacity into typed virtual devices (vdevs)
//! - First-boot provisioning and discovery-based reattach
//! - Per-vdev contiguous page allocation
//! - Shared block caching with configurable per-store caching modes
//! - The meta-block manager for small named superblocks

pub mod blkstore;
pub mod cache;
pub mod device;
pub mod layout;
pub mod meta;
pub mod raw_io;
pub mod resource;
pub mod vdev;

// Re-exports
pub use blkstore::{BlkAllocCp, BlkStore, CacheMode, CompletionCb, IndexBlkStore, IndexBuffer, IoKind};
pub use cache::{BlockCache, CacheKey, CacheStats};
pub use device::{DeviceManager, DeviceStats, VdevErrorHook};
pub use layout::{FleetHeader, VdevRecord, DATA_AREA_OFFSET, MAX_VDEVS, VDEV_CONTEXT_CEILING};
pub use meta::{MetaBlkMgr, MetaCookie, MetaFoundCb};
pub use raw_io::{AlignedBuffer, RawFile};
pub use resource::ResourceMgr;
pub use vdev::Vdev;
