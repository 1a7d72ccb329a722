//! Process-wide resource knobs
//!
//! One `ResourceMgr` per engine instance, passed by reference. It holds
//! the fleet capacity, derives the cache byte budget from it, and the
//! allocator's memory release cadence.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Cache budget is `total capacity / CACHE_DIVISOR`, clamped
const CACHE_DIVISOR: u64 = 16;
const MIN_CACHE_SIZE: u64 = 1024 * 1024;
const MAX_CACHE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default cadence of returning freed allocator pages to the OS
const DEFAULT_MEM_RELEASE_RATE: u32 = 16;

/// Process-wide knobs for one engine instance
pub struct ResourceMgr {
    total_cap: AtomicU64,
    cache_size: AtomicU64,
    mem_release_rate: AtomicU32,
}

impl ResourceMgr {
    /// Create a manager with no capacity yet
    pub fn new() -> Self {
        Self {
            total_cap: AtomicU64::new(0),
            cache_size: AtomicU64::new(MIN_CACHE_SIZE),
            mem_release_rate: AtomicU32::new(DEFAULT_MEM_RELEASE_RATE),
        }
    }

    /// Record the fleet capacity and derive the cache budget from it
    pub fn set_total_cap(&self, cap: u64) {
        self.total_cap.store(cap, Ordering::Release);
        let cache = (cap / CACHE_DIVISOR).clamp(MIN_CACHE_SIZE, MAX_CACHE_SIZE);
        self.cache_size.store(cache, Ordering::Release);
    }

    /// Total fleet capacity in bytes
    pub fn total_cap(&self) -> u64 {
        self.total_cap.load(Ordering::Acquire)
    }

    /// Cache byte budget
    pub fn cache_size(&self) -> u64 {
        self.cache_size.load(Ordering::Acquire)
    }

    /// Allocator page-return cadence
    pub fn mem_release_rate(&self) -> u32 {
        self.mem_release_rate.load(Ordering::Relaxed)
    }

    /// Tune the allocator page-return cadence
    pub fn set_mem_release_rate(&self, rate: u32) {
        self.mem_release_rate.store(rate, Ordering::Relaxed);
    }
}

impl Default for ResourceMgr {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_size_is_bounded_fraction() {
        let mgr = ResourceMgr::new();
        assert_eq!(mgr.cache_size(), MIN_CACHE_SIZE);

        mgr.set_total_cap(64 << 20);
        assert_eq!(mgr.cache_size(), 4 << 20);

        mgr.set_total_cap(1);
        assert_eq!(mgr.cache_size(), MIN_CACHE_SIZE);

        mgr.set_total_cap(u64::MAX / 2);
        assert_eq!(mgr.cache_size(), MAX_CACHE_SIZE);
    }
}
