use std::collections::BTreeMap;
use std::hash::Hash;
use std::ptr::NonNull;

use super::attempt::AttemptRegistry;
use super::chunk::MemoryChunk;
use super::error::CacheError;
use super::handle::ValueHandle;
use super::region::{Allocation, RegionRef, RegionTables};
use super::stats::CacheStats;
use super::vm::{self, PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex};

/// Everything a cache key must provide: a total order (keyed index), hashing
/// (attempt registry), and cheap copies.
pub trait CacheKey: Ord + Hash + Clone {}
impl<T: Ord + Hash + Clone> CacheKey for T {}

pub const DEFAULT_MIN_CHUNK_SIZE: usize = 1 << 20;
pub const DEFAULT_VALUE_ALIGNMENT: usize = 16;

/// Construction-time tuning for [`SlabCache`]. All fields have sensible
/// defaults.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Smallest chunk the cache will map. Requests larger than this round
    /// the chunk up to whole pages instead.
    pub min_chunk_size: usize,
    /// Alignment (and minimum granule) of every carved payload span.
    /// Must be a power of two no larger than the page size.
    pub value_alignment: usize,
    /// Advisory placement hint for new chunk mappings, called with the chunk
    /// size about to be mapped.
    pub address_hint: fn(usize) -> *mut u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            value_alignment: DEFAULT_VALUE_ALIGNMENT,
            address_hint: vm::default_address_hint,
        }
    }
}

/// A reference-counted, mmap-backed slab cache bounded by a fixed byte
/// budget.
///
/// Keys map to values whose payload storage is carved out of large anonymous
/// mappings owned by the cache. Values pinned by a live [`ValueHandle`] are
/// never evicted; unpinned values stay cached and addressable until budget
/// pressure reclaims them, least recently released first, coalescing
/// neighbouring spans to fight fragmentation.
///
/// Concurrent producers for the same key rendezvous on a per-key insertion
/// attempt, so `size_fn`/`init_fn` run at most once per miss across any
/// number of racing threads (no cache stampede).
///
/// Cloning handles is O(1); the cache itself is `Sync` and shared by
/// reference.
pub struct SlabCache<K: CacheKey, V> {
    shared: Arc<CacheShared<K, V>>,
}

impl<K: CacheKey, V> std::fmt::Debug for SlabCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabCache").finish_non_exhaustive()
    }
}

pub(crate) struct CacheShared<K: CacheKey, V> {
    max_cache_size: usize,
    min_chunk_size: usize,
    value_alignment: usize,
    address_hint: fn(usize) -> *mut u8,

    /// Table lock: regions, indexes, chunks and the non-atomic totals.
    inner: Mutex<CacheInner<K, V>>,
    /// Keyed index over every initialized region, pinned or not.
    /// Ordered after the table lock and the region mutex (taken last).
    by_key: Mutex<BTreeMap<K, RegionRef>>,
    /// Per-key producer rendezvous.
    attempts: AttemptRegistry<K, V>,

    total_size_in_use: AtomicUsize,
    total_size_initialized: AtomicUsize,
    hits: AtomicUsize,
    concurrent_hits: AtomicUsize,
    misses: AtomicUsize,
}

struct CacheInner<K: CacheKey, V> {
    tables: RegionTables<K, V>,

    total_chunks_size: usize,
    total_allocated_size: usize,

    allocations: usize,
    allocated_bytes: usize,
    evictions: usize,
    evicted_bytes: usize,
    secondary_evictions: usize,

    /// Number of shrinks that disposed regions while pinned chunks survived;
    /// such chunks are no longer exactly tiled, which relaxes the debug
    /// invariant check.
    partial_shrinks: usize,
}

// Safety: all interior-mutable region and table state is only touched under
// the `inner` mutex (see `RegionMetadata`); raw pointers into chunks never
// leave the cache except through pinned handles.
unsafe impl<K: CacheKey + Send + Sync, V: Send + Sync> Send for CacheShared<K, V> {}
// Safety: same reasoning; the public surface hands out `&V` only while the
// region is pinned.
unsafe impl<K: CacheKey + Send + Sync, V: Send + Sync> Sync for CacheShared<K, V> {}

impl<K: CacheKey, V> SlabCache<K, V> {
    /// Create a cache bounded by `max_cache_size` bytes with the default
    /// configuration.
    ///
    /// # Errors
    ///
    /// `CacheError::BadArguments` if `max_cache_size` is smaller than the
    /// minimum chunk size.
    pub fn new(max_cache_size: usize) -> Result<Self, CacheError> {
        Self::with_config(max_cache_size, CacheConfig::default())
    }

    /// Create a cache bounded by `max_cache_size` bytes.
    ///
    /// # Errors
    ///
    /// `CacheError::BadArguments` if `max_cache_size < config.min_chunk_size`,
    /// if `config.min_chunk_size` is zero, or if `config.value_alignment` is
    /// not a power of two dividing the page size.
    pub fn with_config(max_cache_size: usize, config: CacheConfig) -> Result<Self, CacheError> {
        if config.min_chunk_size == 0 {
            return Err(CacheError::BadArguments(
                "minimum chunk size must be non-zero".into(),
            ));
        }
        if max_cache_size < config.min_chunk_size {
            return Err(CacheError::BadArguments(
                "cache max size must not be less than the minimum chunk size".into(),
            ));
        }
        if !config.value_alignment.is_power_of_two() {
            return Err(CacheError::BadArguments(
                "value alignment must be a power of two".into(),
            ));
        }
        if config.value_alignment > PlatformVmOps::page_size() {
            return Err(CacheError::BadArguments(
                "value alignment must not exceed the page size".into(),
            ));
        }

        Ok(Self {
            shared: Arc::new(CacheShared {
                max_cache_size,
                min_chunk_size: config.min_chunk_size,
                value_alignment: config.value_alignment,
                address_hint: config.address_hint,
                inner: Mutex::new(CacheInner {
                    tables: RegionTables::new(),
                    total_chunks_size: 0,
                    total_allocated_size: 0,
                    allocations: 0,
                    allocated_bytes: 0,
                    evictions: 0,
                    evicted_bytes: 0,
                    secondary_evictions: 0,
                    partial_shrinks: 0,
                }),
                by_key: Mutex::new(BTreeMap::new()),
                attempts: AttemptRegistry::new(),
                total_size_in_use: AtomicUsize::new(0),
                total_size_initialized: AtomicUsize::new(0),
                hits: AtomicUsize::new(0),
                concurrent_hits: AtomicUsize::new(0),
                misses: AtomicUsize::new(0),
            }),
        })
    }

    /// Look `key` up in the cache.
    ///
    /// Returns a handle pinning the value on a hit; `None` (and a recorded
    /// miss) otherwise. A value whose handles were all dropped remains
    /// addressable until it is evicted.
    pub fn get(&self, key: &K) -> Option<ValueHandle<K, V>> {
        let result = self.shared.lookup(key);
        if result.is_some() {
            self.shared.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Look `key` up; on a miss, produce the value.
    ///
    /// `size_fn` yields the payload size in bytes; `init_fn` receives the
    /// payload span and must construct the value (arranging any internal
    /// references to point into the span). At most one of any number of
    /// concurrent callers for the same key runs the callbacks; the rest wait
    /// and share the produced handle.
    ///
    /// Returns the handle plus a flag telling whether this call produced the
    /// value. `(None, true)` signals that the cache is full and wholly
    /// pinned; that is a load-shedding signal, not an error.
    ///
    /// # Errors
    ///
    /// `CacheError::Map` if growing the cache failed, or whatever error the
    /// callbacks return. After a callback error the allocation is rolled
    /// back and a waiting sibling retries with its own callbacks.
    ///
    /// The callbacks run while the key's attempt is locked: they must not
    /// re-enter the cache with the same key.
    pub fn get_or_set<S, I>(
        &self,
        key: &K,
        size_fn: S,
        init_fn: I,
    ) -> Result<(Option<ValueHandle<K, V>>, bool), CacheError>
    where
        S: FnOnce() -> Result<usize, CacheError>,
        I: FnOnce(NonNull<u8>) -> Result<V, CacheError>,
    {
        let shared = &self.shared;

        if let Some(handle) = shared.lookup(key) {
            shared.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((Some(handle), false));
        }

        let guard = shared.attempts.acquire(key);
        let mut state = guard.attempt().state.lock().unwrap();

        if let Some(handle) = state.value.clone() {
            // Another producer finished while we waited on the attempt.
            shared.hits.fetch_add(1, Ordering::Relaxed);
            shared.concurrent_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((Some(handle), false));
        }

        shared.misses.fetch_add(1, Ordering::Relaxed);

        // This thread is the producer. Callback errors propagate; the
        // attempt stays unfulfilled so a sibling retries on its own.
        let requested = size_fn()?;

        let Some(alloc) = shared.allocate(requested)? else {
            log::warn!("cache is full and wholly pinned; cannot allocate {requested} bytes");
            return Ok((None, true));
        };

        // Safety: the carved region is private to this thread until
        // publication; it is linked in the adjacency list only.
        let region = unsafe { alloc.region.as_ref() };
        // Safety: fresh region, key cell uninitialized, exclusively ours.
        unsafe { region.init_key(key.clone()) };
        shared
            .total_size_initialized
            .fetch_add(alloc.size, Ordering::Relaxed);

        let value = match init_fn(alloc.ptr) {
            // Safety: fresh region, value cell uninitialized, exclusively ours.
            Ok(value) => unsafe { region.init_value(value) },
            Err(e) => {
                {
                    let mut inner = shared.inner.lock().unwrap();
                    // Safety: still private; roll the key back before the
                    // span rejoins the free multiset.
                    unsafe { region.destroy_key() };
                    region.chunk().unpin();
                    inner.total_allocated_size -= alloc.size;
                    inner.tables.free_and_coalesce(alloc.rref.slot);
                    #[cfg(debug_assertions)]
                    inner.tables.validate(inner.partial_shrinks == 0);
                }
                shared
                    .total_size_initialized
                    .fetch_sub(alloc.size, Ordering::Relaxed);
                return Err(e);
            }
        };

        let handle = shared.publish(key, &alloc, value);
        // Fulfil the attempt for the siblings queued behind us.
        state.value = Some(handle.clone());
        Ok((Some(handle), true))
    }

    /// Dispose every free and unpinned region, then unmap every chunk no
    /// region pins. Pinned values are left untouched. The attempt registry
    /// is cleared. With `clear_stats`, the event counters (hits, misses,
    /// allocations, evictions, ...) are zeroed; the structural gauges always
    /// reflect reality.
    pub fn shrink_to_fit(&self, clear_stats: bool) {
        let shared = &self.shared;
        shared.attempts.clear();

        let mut inner = shared.inner.lock().unwrap();
        let mut disposed_any = false;

        {
            // Scoped multi-lock: the reclaim loop edits the keyed index for
            // every region it disposes.
            let mut by_key = shared.by_key.lock().unwrap();
            while let Some(slot) = inner.tables.lru_front() {
                inner.tables.unlink_unused(slot);
                let rref = inner.tables.make_ref(slot);
                let region = inner.tables.region(slot);
                let size = region.size();
                // Safety: key cell reads are serialized by the table lock.
                if let Some(key) = unsafe { region.clone_key() } {
                    if by_key.get(&key) == Some(&rref) {
                        by_key.remove(&key);
                    }
                }
                inner.total_allocated_size -= size;
                shared
                    .total_size_initialized
                    .fetch_sub(size, Ordering::Relaxed);
                inner.tables.unlink_all(slot);
                inner.tables.dispose(slot);
                disposed_any = true;
            }
        }

        while let Some(slot) = inner.tables.any_free() {
            inner.tables.remove_free(slot);
            inner.tables.unlink_all(slot);
            inner.tables.dispose(slot);
            disposed_any = true;
        }

        let released = inner.tables.release_unpinned_chunks();
        inner.total_chunks_size -= released;

        if inner.tables.chunk_count() == 0 {
            inner.partial_shrinks = 0;
        } else if disposed_any {
            // Survivors keep their pinned regions but lost the free padding
            // around them; exact tiling no longer holds.
            inner.partial_shrinks += 1;
        }

        if clear_stats {
            inner.allocations = 0;
            inner.allocated_bytes = 0;
            inner.evictions = 0;
            inner.evicted_bytes = 0;
            inner.secondary_evictions = 0;
            shared.hits.store(0, Ordering::Relaxed);
            shared.concurrent_hits.store(0, Ordering::Relaxed);
            shared.misses.store(0, Ordering::Relaxed);
        }

        #[cfg(debug_assertions)]
        inner.tables.validate(inner.partial_shrinks == 0);
    }

    /// Equivalent to [`shrink_to_fit(true)`](Self::shrink_to_fit).
    /// Pinned values survive; evicting them is unsupported.
    pub fn reset(&self) {
        self.shrink_to_fit(true);
    }

    /// Atomic-enough snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let shared = &self.shared;
        let mut out = CacheStats::default();
        let unused;
        {
            let inner = shared.inner.lock().unwrap();
            out.chunks_size = inner.total_chunks_size;
            out.allocated_size = inner.total_allocated_size;
            out.chunks = inner.tables.chunk_count();
            out.regions = inner.tables.region_count();
            out.free_regions = inner.tables.free_count();
            unused = inner.tables.unused_count();
            out.unused_regions = unused;
            out.allocations = inner.allocations;
            out.allocated_bytes = inner.allocated_bytes;
            out.evictions = inner.evictions;
            out.evicted_bytes = inner.evicted_bytes;
            out.secondary_evictions = inner.secondary_evictions;
        }

        out.initialized_size = shared.total_size_initialized.load(Ordering::Relaxed);
        out.in_use_size = shared.total_size_in_use.load(Ordering::Relaxed);
        out.hits = shared.hits.load(Ordering::Relaxed);
        out.concurrent_hits = shared.concurrent_hits.load(Ordering::Relaxed);
        out.misses = shared.misses.load(Ordering::Relaxed);

        // Taken after the table lock is released, never nested inside it.
        out.used_regions = shared.by_key.lock().unwrap().len().saturating_sub(unused);
        out
    }

    /// Total bytes currently pinned by live handles.
    pub fn size_in_use(&self) -> usize {
        self.shared.total_size_in_use.load(Ordering::Relaxed)
    }

    /// Number of keys currently pinned by live handles.
    pub fn used_regions_count(&self) -> usize {
        self.stats().used_regions
    }

    /// Cross-check every index, gauge and flag. Call only while no operation
    /// is in flight (a producer mid-initialization skews the gauges).
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn validate_quiescent(&self) {
        let shared = &self.shared;
        let inner = shared.inner.lock().unwrap();
        inner.tables.validate(inner.partial_shrinks == 0);

        assert_eq!(inner.total_chunks_size, inner.tables.chunks_total_size());
        assert!(inner.total_chunks_size <= shared.max_cache_size);
        assert_eq!(
            inner.total_allocated_size,
            inner.tables.sum_sizes(|r| !r.is_free()),
        );
        assert_eq!(
            shared.total_size_initialized.load(Ordering::Relaxed),
            inner.tables.sum_sizes(|r| r.value_initialized()),
        );
        assert_eq!(
            shared.total_size_in_use.load(Ordering::Relaxed),
            inner
                .tables
                .sum_sizes(|r| r.value_initialized() && !r.is_unused()),
        );
        let initialized_regions = inner.tables.count_regions(|r| r.value_initialized());
        drop(inner);
        assert_eq!(shared.by_key.lock().unwrap().len(), initialized_regions);
    }
}

impl<K: CacheKey, V> CacheShared<K, V> {
    /// Hit path shared by `get` and `get_or_set`: find, re-validate, pin.
    fn lookup(self: &Arc<Self>, key: &K) -> Option<ValueHandle<K, V>> {
        let rref = { self.by_key.lock().unwrap().get(key).copied() }?;

        let mut inner = self.inner.lock().unwrap();
        let region_ptr = inner.tables.resolve(rref)?;
        // Safety: resolution under the table lock proved the slot generation
        // still matches; the region cannot be disposed while we hold it.
        let region = unsafe { region_ptr.as_ref() };

        // The keyed-index read raced evictions: the span may have been
        // reclaimed, or even re-carved for another occupant. Re-validate.
        // Safety: key cell reads are serialized by the table lock.
        if !region.value_initialized() || !unsafe { region.key_equals(key) } {
            return None;
        }

        let mut refcount = region.refcount.lock().unwrap();
        *refcount += 1;
        if *refcount == 1 {
            // First handle again: leave the evictable set.
            debug_assert!(region.is_unused());
            if region.is_unused() {
                inner.tables.unlink_unused(rref.slot);
            }
            region.chunk().pin();
            self.total_size_in_use
                .fetch_add(region.size(), Ordering::Relaxed);
        }
        // Safety: pinned above; the value cell stays in place until the last
        // handle releases it.
        let Some(value) = (unsafe { region.value_ptr() }) else {
            debug_assert!(false, "pinned region lost its value");
            // Safety: Unreachable logic.
            unsafe { std::hint::unreachable_unchecked() }
        };
        drop(refcount);
        drop(inner);

        Some(ValueHandle::new(Arc::clone(self), rref, value))
    }

    /// Value-delete hook: runs when the last handle for a value drops.
    pub(crate) fn release_value(&self, rref: RegionRef) {
        let mut inner = self.inner.lock().unwrap();
        let Some(region_ptr) = inner.tables.resolve(rref) else {
            debug_assert!(false, "release of a region that no longer resolves");
            return;
        };
        // Safety: a region with outstanding handles is never disposed; the
        // reference resolves for as long as this (last) handle exists.
        let region = unsafe { region_ptr.as_ref() };

        let mut refcount = region.refcount.lock().unwrap();
        debug_assert!(*refcount > 0, "region refcount underflow");
        *refcount -= 1;
        if *refcount > 0 {
            return;
        }

        // Most recently released: tail of the LRU list. The key stays in the
        // keyed index, so the value remains addressable until evicted.
        inner.tables.push_unused_back(rref.slot);
        region.chunk().unpin();
        self.total_size_in_use
            .fetch_sub(region.size(), Ordering::Relaxed);

        #[cfg(debug_assertions)]
        inner.tables.validate(inner.partial_shrinks == 0);
    }

    /// Publication of a freshly initialized region: first pin plus keyed
    /// index entry.
    fn publish(
        self: &Arc<Self>,
        key: &K,
        alloc: &Allocation<K, V>,
        value: NonNull<V>,
    ) -> ValueHandle<K, V> {
        let inner = self.inner.lock().unwrap();
        // Safety: the region is ours until this function links it.
        let region = unsafe { alloc.region.as_ref() };
        let mut refcount = region.refcount.lock().unwrap();
        debug_assert_eq!(*refcount, 0);
        *refcount = 1;
        // The chunk was pinned when the span was carved.
        self.total_size_in_use
            .fetch_add(alloc.size, Ordering::Relaxed);
        self.by_key.lock().unwrap().insert(key.clone(), alloc.rref);
        drop(refcount);
        drop(inner);

        ValueHandle::new(Arc::clone(self), alloc.rref, value)
    }

    /// Main allocation routine: best-fit free region, then a new chunk if
    /// the budget allows, then eviction.
    ///
    /// Returns `Ok(None)` when the cache is full and wholly pinned.
    fn allocate(&self, requested: usize) -> Result<Option<Allocation<K, V>>, CacheError> {
        let size = if requested == 0 {
            self.value_alignment
        } else {
            requested.next_multiple_of(self.value_alignment)
        };

        let mut inner = self.inner.lock().unwrap();

        if let Some(slot) = inner.tables.best_fit(size) {
            return Ok(Some(self.take_from_free(&mut inner, slot, size)));
        }

        // Nothing suitable: map another chunk if the budget allows.
        let chunk_size = self
            .min_chunk_size
            .max(size.next_multiple_of(PlatformVmOps::page_size()));
        if inner.total_chunks_size + chunk_size <= self.max_cache_size {
            let hint = (self.address_hint)(chunk_size);
            let chunk = MemoryChunk::map(chunk_size, hint)?;
            let slot = inner.tables.add_chunk(chunk);
            inner.total_chunks_size += chunk_size;
            return Ok(Some(self.take_from_free(&mut inner, slot, size)));
        }

        // Evict until the coalesced block is big enough, or nothing is left.
        loop {
            let Some(slot) = self.evict_locked(&mut inner, size) else {
                return Ok(None);
            };
            if inner.tables.region(slot).size() < size {
                // Not enough even after coalescing: evict more.
                continue;
            }
            return Ok(Some(self.take_from_free(&mut inner, slot, size)));
        }
    }

    /// Carve `size` bytes out of free region `slot` and account for it.
    fn take_from_free(
        &self,
        inner: &mut CacheInner<K, V>,
        slot: usize,
        size: usize,
    ) -> Allocation<K, V> {
        let slot = inner.tables.carve_from_free(slot, size);
        inner.total_allocated_size += size;
        inner.allocations += 1;
        inner.allocated_bytes += size;
        // Pin the chunk for the whole producer-private phase so a concurrent
        // shrink cannot unmap it from under the initializer.
        inner.tables.region(slot).chunk().pin();
        #[cfg(debug_assertions)]
        inner.tables.validate(inner.partial_shrinks == 0);
        inner.tables.allocation(slot)
    }

    /// Evict the least recently released region, coalescing; while the block
    /// stays too small, keep evicting adjacent evictable regions within the
    /// same chunk (secondary evictions) to amplify it.
    ///
    /// The returned slot is in the free multiset, possibly still smaller
    /// than `requested` when no adjacent candidate was left.
    fn evict_locked(&self, inner: &mut CacheInner<K, V>, requested: usize) -> Option<usize> {
        let mut slot = inner.tables.lru_front()?;
        loop {
            let (size, chunk, rref) = {
                let region = inner.tables.region(slot);
                (region.size(), region.chunk_ptr(), inner.tables.make_ref(slot))
            };
            inner.tables.unlink_unused(slot);

            // The evicted value stops being addressable.
            // Safety: key cell reads are serialized by the table lock.
            if let Some(key) = unsafe { inner.tables.region(slot).clone_key() } {
                let mut by_key = self.by_key.lock().unwrap();
                if by_key.get(&key) == Some(&rref) {
                    by_key.remove(&key);
                }
            }

            inner.total_allocated_size -= size;
            self.total_size_initialized
                .fetch_sub(size, Ordering::Relaxed);
            inner.evictions += 1;
            inner.evicted_bytes += size;

            {
                let region = inner.tables.region(slot);
                // Safety: the refcount is zero (the region was evictable) and
                // we hold the table lock; no handle can observe the cells.
                unsafe {
                    region.destroy_key();
                    region.destroy_value();
                }
            }
            inner.tables.free_and_coalesce(slot);

            if inner.tables.region(slot).size() >= requested {
                return Some(slot);
            }

            // Amplify the coalesced block instead of scattering small holes:
            // continue into the address-order neighbour if it is evictable
            // and shares the chunk.
            let Some(next) = inner.tables.all_next(slot) else {
                return Some(slot);
            };
            let next_region = inner.tables.region(next);
            if next_region.chunk_ptr() != chunk || !next_region.is_unused() {
                return Some(slot);
            }
            inner.secondary_evictions += 1;
            slot = next;
        }
    }
}
