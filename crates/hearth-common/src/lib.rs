//! Hearth Common - Shared types and utilities
//!
//! This crate provides the types shared by every hearth component:
//! error definitions, core identifiers (block ids, vdev ids), drive
//! attributes and the engine configuration.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{compute_crc32c, verify_crc32c};
pub use config::{DeviceType, EngineConfig};
pub use error::{Error, Result};
pub use types::*;
