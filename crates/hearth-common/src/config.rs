//! Configuration types for hearth
//!
//! Structured values only; hearth does no flag parsing.

use crate::types::DriveAttributes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kind of backing device behind the engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    /// Regular file (buffered I/O, used by tests and dev setups)
    #[default]
    File,
    /// Raw block device (direct I/O)
    Block,
}

/// Input configuration for [`Engine::init`]
///
/// [`Engine::init`]: https://docs.rs/hearth-engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Paths of the raw devices to carve up
    pub devices: Vec<PathBuf>,
    /// Kind of the backing devices
    pub device_type: DeviceType,
    /// Override for detected drive attributes
    pub drive_attr: Option<DriveAttributes>,
    /// Smallest virtual page size exposed by the data store
    pub min_virtual_page_size: u32,
    /// Restricted mode disables first-boot formatting
    pub is_restricted_mode: bool,
    /// Run block-store recovery automatically on reattach
    pub auto_recovery: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            device_type: DeviceType::File,
            drive_attr: None,
            min_virtual_page_size: 4096,
            is_restricted_mode: false,
            auto_recovery: true,
        }
    }
}

impl EngineConfig {
    /// Convenience constructor for a file-backed engine
    pub fn with_devices(devices: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert!(cfg.devices.is_empty());
        assert_eq!(cfg.device_type, DeviceType::File);
        assert_eq!(cfg.min_virtual_page_size, 4096);
        assert!(cfg.auto_recovery);
    }
}
