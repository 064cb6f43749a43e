//! All global counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., the mapped-bytes gauge may briefly disagree with the
//! live-chunk count). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize) as isize
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    #[allow(dead_code)]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0) as usize
    }
}

// Out-of-band memory accounting: every chunk mmap is reported here on the way
// in and symmetrically on the way out, so an embedding process can observe the
// cache's footprint without holding any of its locks.

// Total bytes currently mapped by every cache instance in the process.
crate::sync::static_atomic! {
    pub static TOTAL_MAPPED: Counter = Counter::new();
}
// Cumulative number of chunk mmap calls.
crate::sync::static_atomic! {
    pub static CHUNKS_MAPPED: Counter = Counter::new();
}
// Cumulative number of chunk munmap calls.
crate::sync::static_atomic! {
    pub static CHUNKS_UNMAPPED: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time snapshot of one cache instance, as returned by
/// [`SlabCache::stats`](crate::SlabCache::stats).
///
/// Sizes are in bytes. `chunks_size` covers every mapped chunk,
/// `allocated_size` every region holding (or about to hold) a value,
/// `in_use_size` only the regions pinned by live handles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub chunks_size: usize,
    pub allocated_size: usize,
    pub initialized_size: usize,
    pub in_use_size: usize,

    pub chunks: usize,
    pub regions: usize,
    pub free_regions: usize,
    pub unused_regions: usize,
    pub used_regions: usize,

    /// Value was in the cache.
    pub hits: usize,
    /// Value we were waiting for was produced by another thread.
    /// Also summed in `hits`.
    pub concurrent_hits: usize,
    /// Value was not found in the cache.
    pub misses: usize,

    pub allocations: usize,
    pub allocated_bytes: usize,
    pub evictions: usize,
    pub evicted_bytes: usize,
    pub secondary_evictions: usize,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_sub() {
        let c = Counter::new();
        c.add(10);
        c.add(5);
        c.sub(3);
        assert_eq!(c.get(), 12);
    }

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(100);
        assert_eq!(c.get(), 0);
        c.add(150);
        // The raw value went to -100 first; readers only ever see the raw
        // value clamped, not a clamped store.
        assert_eq!(c.get(), 50);
    }

    #[test]
    fn test_sub_saturating() {
        let c = Counter::new();
        c.add(7);
        sub_saturating(&c, 3);
        assert_eq!(c.get(), 4);
    }
}
