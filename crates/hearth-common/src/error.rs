//! Error types for hearth
//!
//! One error enum is shared across the engine. Construction errors are
//! fatal (the engine must be rebuilt); operational errors leave the
//! engine healthy; vdev failures poison a single vdev.

use thiserror::Error;

/// Common result type for hearth operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for hearth
#[derive(Debug, Error)]
pub enum Error {
    #[error("device I/O error: {0}")]
    DeviceIo(#[from] std::io::Error),

    #[error("incompatible drives: {0}")]
    IncompatibleDrives(String),

    #[error("insufficient capacity: required {required} bytes, available {available} bytes")]
    InsufficientCapacity { required: u64, available: u64 },

    #[error("corrupt on-disk layout: {0}")]
    CorruptLayout(String),

    #[error("space not available")]
    OutOfSpace,

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("vdev {0} is in failed state")]
    VdevFailed(u32),

    #[error("init failed: {0}")]
    InitFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an out-of-range error
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a corrupt layout error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptLayout(msg.into())
    }

    /// Errors that leave the engine unusable until it is reconstructed
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IncompatibleDrives(_)
                | Self::CorruptLayout(_)
                | Self::InitFailed(_)
                | Self::VdevFailed(_)
        )
    }

    /// Errors the caller can recover from without restarting the engine
    #[must_use]
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            Self::OutOfSpace | Self::OutOfRange(_) | Self::InvalidArgument(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::InitFailed("bad".into()).is_fatal());
        assert!(Error::VdevFailed(3).is_fatal());
        assert!(!Error::OutOfSpace.is_fatal());

        assert!(Error::OutOfSpace.is_operational());
        assert!(Error::out_of_range("lsn 5 truncated").is_operational());
        assert!(!Error::corrupt("bad magic").is_operational());
    }
}
