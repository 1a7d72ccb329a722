//! Shared log-service types

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Per-store monotonic sequence number assigned to a log record
pub type Lsn = i64;

/// The invalid sequence number sentinel
pub const INVALID_LSN: Lsn = i64::MIN;

/// Opaque per-request context passed back through completions
pub type Cookie = u64;

/// The log device's address for a persisted record: the flush batch it
/// belongs to plus its position within the batch. The unit of
/// device-side truncation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogDevKey {
    pub batch: u64,
    pub offset: u32,
}

impl LogDevKey {
    /// The invalid sentinel
    pub const INVALID: LogDevKey = LogDevKey {
        batch: u64::MAX,
        offset: u32::MAX,
    };

    /// Create a key
    #[must_use]
    pub const fn new(batch: u64, offset: u32) -> Self {
        Self { batch, offset }
    }

    /// Whether this key addresses a persisted record
    #[must_use]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Debug for LogDevKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "LogDevKey({}:{})", self.batch, self.offset)
        } else {
            write!(f, "LogDevKey(invalid)")
        }
    }
}

impl fmt::Display for LogDevKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.batch, self.offset)
    }
}

/// A store's safe truncation boundary: the highest flush-aligned barrier
/// at or below its in-memory truncation floor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncationInfo {
    pub lsn: Lsn,
    pub key: LogDevKey,
}

/// Completion callback for writes and appends: `(lsn, ld_key, cookie)`
pub type LogWriteCompCb = Arc<dyn Fn(Lsn, LogDevKey, Cookie) + Send + Sync>;

/// Callback for reads: `(lsn, buf, cookie)`
pub type ReadCb = Arc<dyn Fn(Lsn, Bytes, Cookie) + Send + Sync>;

/// Callback per replayed record during recovery: `(lsn, buf)`
pub type LogFoundCb = Arc<dyn Fn(Lsn, Bytes) + Send + Sync>;

/// Callback once replay of a store has finished
pub type LogReplayDoneCb = Arc<dyn Fn() + Send + Sync>;

/// Callback once a rollback marker is durable: `(to_lsn)`
pub type RollbackCb = Arc<dyn Fn(Lsn) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logdev_key_ordering() {
        let a = LogDevKey::new(1, 5);
        let b = LogDevKey::new(1, 6);
        let c = LogDevKey::new(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(LogDevKey::INVALID > c);
    }

    #[test]
    fn test_invalid_key() {
        assert!(!LogDevKey::INVALID.is_valid());
        assert!(LogDevKey::new(0, 0).is_valid());
    }
}
