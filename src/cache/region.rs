use std::collections::BTreeSet;
use std::ptr::NonNull;

#[cfg(any(test, debug_assertions))]
use fixedbitset::FixedBitSet;

use super::chunk::MemoryChunk;
use crate::sync::atomic::{AtomicBool, Ordering};
use crate::sync::cell::{Cell, UnsafeCell};
use crate::sync::{unsafe_cell_get, unsafe_cell_get_mut, Mutex};

/// Stable, generation-checked reference to a region slot.
///
/// A `RegionRef` held across an unlock (by a handle, or by the used-key map)
/// may go stale: the region can be disposed, or evicted and re-carved for a
/// different key. `RegionTables::resolve` rejects stale references, which
/// makes the re-validation on the lookup fast path sound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct RegionRef {
    pub(crate) slot: usize,
    pub(crate) gen: u64,
}

/// Metadata for one contiguous byte span inside exactly one chunk.
///
/// A region is always in one of three logical states:
///   - free: no key/value, linked in the free multiset;
///   - unused: key+value present, refcount 0, linked in the LRU list;
///   - used: key+value present, refcount >= 1, tracked by the used-key map.
/// Regions in every state are threaded through the adjacency list, which
/// orders them by address so eviction can coalesce neighbours.
///
/// All non-atomic fields are interior-mutable `Cell`s written only under the
/// cache's table lock (see `CacheShared`); they are never accessed through
/// `&mut`, so live handles may keep raw pointers into the value cell while
/// other threads update the structural fields of *other* regions.
pub(crate) struct RegionMetadata<K, V> {
    /// Start of the payload span inside `chunk`.
    ptr: Cell<NonNull<u8>>,
    /// Span length, a multiple of the cache's value alignment.
    size: Cell<usize>,
    /// Owning chunk; set once at creation.
    chunk: NonNull<MemoryChunk>,

    // Adjacency list links (slot indices).
    all_prev: Cell<Option<usize>>,
    all_next: Cell<Option<usize>>,
    // LRU list links (slot indices).
    lru_prev: Cell<Option<usize>>,
    lru_next: Cell<Option<usize>>,

    in_free: Cell<bool>,
    in_unused: Cell<bool>,

    key_init: AtomicBool,
    value_init: AtomicBool,
    key: UnsafeCell<Option<K>>,
    value: UnsafeCell<Option<V>>,

    /// Outer-handle reference count. Guarded by its own mutex so that handle
    /// creation and release serialize with each other even across the point
    /// where the releasing thread has already dropped the table lock.
    pub(crate) refcount: Mutex<usize>,
}

impl<K, V> RegionMetadata<K, V> {
    pub(crate) fn new(ptr: NonNull<u8>, size: usize, chunk: NonNull<MemoryChunk>) -> Self {
        Self {
            ptr: Cell::new(ptr),
            size: Cell::new(size),
            chunk,
            all_prev: Cell::new(None),
            all_next: Cell::new(None),
            lru_prev: Cell::new(None),
            lru_next: Cell::new(None),
            in_free: Cell::new(false),
            in_unused: Cell::new(false),
            key_init: AtomicBool::new(false),
            value_init: AtomicBool::new(false),
            key: UnsafeCell::new(None),
            value: UnsafeCell::new(None),
            refcount: Mutex::new(0),
        }
    }

    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr.get()
    }

    pub(crate) fn size(&self) -> usize {
        self.size.get()
    }

    fn set_span(&self, ptr: NonNull<u8>, size: usize) {
        self.ptr.set(ptr);
        self.size.set(size);
    }

    pub(crate) fn chunk(&self) -> &MemoryChunk {
        // Safety: a region never outlives its owning chunk; the tables
        // dispose every region metadata before dropping the chunk.
        unsafe { self.chunk.as_ref() }
    }

    pub(crate) fn chunk_ptr(&self) -> NonNull<MemoryChunk> {
        self.chunk
    }

    pub(crate) fn is_free(&self) -> bool {
        self.in_free.get()
    }

    pub(crate) fn is_unused(&self) -> bool {
        self.in_unused.get()
    }

    pub(crate) fn key_initialized(&self) -> bool {
        self.key_init.load(Ordering::Relaxed)
    }

    pub(crate) fn value_initialized(&self) -> bool {
        self.value_init.load(Ordering::Relaxed)
    }

    /// Install the key.
    ///
    /// # Safety
    /// The key cell must be uninitialized and the caller must have exclusive
    /// logical ownership of it: either the table lock, or a freshly carved
    /// region no other thread can reach.
    pub(crate) unsafe fn init_key(&self, key: K) {
        let cell = unsafe_cell_get_mut!(&self.key);
        debug_assert!(cell.is_none());
        *cell = Some(key);
        self.key_init.store(true, Ordering::Relaxed);
    }

    /// # Safety
    /// Same ownership requirement as [`init_key`](Self::init_key).
    pub(crate) unsafe fn destroy_key(&self) {
        let cell = unsafe_cell_get_mut!(&self.key);
        *cell = None;
        self.key_init.store(false, Ordering::Relaxed);
    }

    /// # Safety
    /// The caller must hold the table lock (the key cell is only mutated
    /// under it once the region is published).
    pub(crate) unsafe fn clone_key(&self) -> Option<K>
    where
        K: Clone,
    {
        let cell: &Option<K> = unsafe_cell_get!(&self.key);
        cell.clone()
    }

    /// # Safety
    /// Same requirement as [`clone_key`](Self::clone_key).
    pub(crate) unsafe fn key_equals(&self, other: &K) -> bool
    where
        K: PartialEq,
    {
        let cell: &Option<K> = unsafe_cell_get!(&self.key);
        cell.as_ref() == Some(other)
    }

    /// Install the value and return a pointer to it that stays valid for as
    /// long as the region is pinned.
    ///
    /// # Safety
    /// The value cell must be uninitialized and the caller must have
    /// exclusive logical ownership of the region (unpublished).
    pub(crate) unsafe fn init_value(&self, value: V) -> NonNull<V> {
        let cell = unsafe_cell_get_mut!(&self.value);
        debug_assert!(cell.is_none());
        let slot = cell.insert(value);
        self.value_init.store(true, Ordering::Relaxed);
        NonNull::from(slot)
    }

    /// # Safety
    /// The caller must hold the table lock and the region's refcount must be
    /// zero: no handle may be dereferencing the value.
    pub(crate) unsafe fn destroy_value(&self) {
        let cell = unsafe_cell_get_mut!(&self.value);
        *cell = None;
        self.value_init.store(false, Ordering::Relaxed);
    }

    /// # Safety
    /// The caller must hold the table lock and the value must stay pinned for
    /// as long as the returned pointer is dereferenced. The access is shared:
    /// other handles may be reading the value concurrently.
    pub(crate) unsafe fn value_ptr(&self) -> Option<NonNull<V>> {
        let cell: &Option<V> = unsafe_cell_get!(&self.value);
        cell.as_ref().map(NonNull::from)
    }
}

/// The carved-out result of an allocation: a region linked in the adjacency
/// list only, ready for key/value initialization by its producer.
pub(crate) struct Allocation<K, V> {
    pub(crate) rref: RegionRef,
    pub(crate) region: NonNull<RegionMetadata<K, V>>,
    pub(crate) ptr: NonNull<u8>,
    pub(crate) size: usize,
}

struct Slot<K, V> {
    gen: u64,
    region: Option<Box<RegionMetadata<K, V>>>,
}

/// Owner of every region metadata object and of the three structural indexes
/// (adjacency list, free-size multiset, unused LRU list) plus the chunk list.
///
/// Guarded as a whole by the cache's table mutex; none of these methods
/// synchronize on their own.
pub(crate) struct RegionTables<K, V> {
    slots: Vec<Slot<K, V>>,
    free_slots: Vec<usize>,
    region_count: usize,

    all_head: Option<usize>,
    all_tail: Option<usize>,

    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    unused_count: usize,

    /// Free regions keyed by (size, slot): an ordered multiset supporting
    /// best-fit lookup.
    free_by_size: BTreeSet<(usize, usize)>,

    chunks: Vec<Box<MemoryChunk>>,
}

impl<K, V> RegionTables<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            region_count: 0,
            all_head: None,
            all_tail: None,
            lru_head: None,
            lru_tail: None,
            unused_count: 0,
            free_by_size: BTreeSet::new(),
            chunks: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Slot arena
    // ------------------------------------------------------------------

    pub(crate) fn region(&self, slot: usize) -> &RegionMetadata<K, V> {
        let Some(region) = self.slots[slot].region.as_deref() else {
            debug_assert!(false, "region slot {slot} is empty");
            // Safety: Unreachable logic.
            unsafe { std::hint::unreachable_unchecked() }
        };
        region
    }

    pub(crate) fn make_ref(&self, slot: usize) -> RegionRef {
        RegionRef {
            slot,
            gen: self.slots[slot].gen,
        }
    }

    /// Resolve a reference taken in the past. Returns `None` if the region
    /// has since been disposed or re-carved for another occupant.
    pub(crate) fn resolve(&self, rref: RegionRef) -> Option<NonNull<RegionMetadata<K, V>>> {
        let slot = self.slots.get(rref.slot)?;
        if slot.gen != rref.gen {
            return None;
        }
        slot.region.as_deref().map(NonNull::from)
    }

    fn insert_region(&mut self, region: RegionMetadata<K, V>) -> usize {
        self.region_count += 1;
        let boxed = Box::new(region);
        if let Some(slot) = self.free_slots.pop() {
            debug_assert!(self.slots[slot].region.is_none());
            self.slots[slot].region = Some(boxed);
            slot
        } else {
            self.slots.push(Slot {
                gen: 0,
                region: Some(boxed),
            });
            self.slots.len() - 1
        }
    }

    fn bump_gen(&mut self, slot: usize) {
        self.slots[slot].gen += 1;
    }

    /// Destroy a region's metadata. The region must already be unlinked from
    /// every index.
    pub(crate) fn dispose(&mut self, slot: usize) {
        let entry = &mut self.slots[slot];
        let Some(region) = entry.region.take() else {
            debug_assert!(false, "disposing empty region slot {slot}");
            // Safety: Unreachable logic.
            unsafe { std::hint::unreachable_unchecked() }
        };
        debug_assert!(!region.in_free.get() && !region.in_unused.get());
        debug_assert_eq!(
            *region.refcount.lock().unwrap(),
            0,
            "disposing a pinned region"
        );
        entry.gen += 1;
        self.free_slots.push(slot);
        self.region_count -= 1;
        // Box drop destroys any remaining key/value.
    }

    pub(crate) fn region_count(&self) -> usize {
        self.region_count
    }

    // ------------------------------------------------------------------
    // Adjacency list
    // ------------------------------------------------------------------

    fn push_back_all(&mut self, slot: usize) {
        let region = self.region(slot);
        region.all_prev.set(self.all_tail);
        region.all_next.set(None);
        match self.all_tail {
            Some(tail) => self.region(tail).all_next.set(Some(slot)),
            None => self.all_head = Some(slot),
        }
        self.all_tail = Some(slot);
    }

    /// Link `slot` immediately before `anchor`.
    fn insert_all_before(&mut self, slot: usize, anchor: usize) {
        let prev = self.region(anchor).all_prev.get();
        let region = self.region(slot);
        region.all_prev.set(prev);
        region.all_next.set(Some(anchor));
        self.region(anchor).all_prev.set(Some(slot));
        match prev {
            Some(p) => self.region(p).all_next.set(Some(slot)),
            None => self.all_head = Some(slot),
        }
    }

    pub(crate) fn unlink_all(&mut self, slot: usize) {
        let region = self.region(slot);
        let prev = region.all_prev.get();
        let next = region.all_next.get();
        region.all_prev.set(None);
        region.all_next.set(None);
        match prev {
            Some(p) => self.region(p).all_next.set(next),
            None => self.all_head = next,
        }
        match next {
            Some(n) => self.region(n).all_prev.set(prev),
            None => self.all_tail = prev,
        }
    }

    pub(crate) fn all_next(&self, slot: usize) -> Option<usize> {
        self.region(slot).all_next.get()
    }

    pub(crate) fn all_prev(&self, slot: usize) -> Option<usize> {
        self.region(slot).all_prev.get()
    }

    // ------------------------------------------------------------------
    // Unused (LRU) list
    // ------------------------------------------------------------------

    /// Append to the tail: most recently released.
    pub(crate) fn push_unused_back(&mut self, slot: usize) {
        let region = self.region(slot);
        debug_assert!(!region.in_unused.get() && !region.in_free.get());
        region.in_unused.set(true);
        region.lru_prev.set(self.lru_tail);
        region.lru_next.set(None);
        match self.lru_tail {
            Some(tail) => self.region(tail).lru_next.set(Some(slot)),
            None => self.lru_head = Some(slot),
        }
        self.lru_tail = Some(slot);
        self.unused_count += 1;
    }

    pub(crate) fn unlink_unused(&mut self, slot: usize) {
        let region = self.region(slot);
        debug_assert!(region.in_unused.get());
        region.in_unused.set(false);
        let prev = region.lru_prev.get();
        let next = region.lru_next.get();
        region.lru_prev.set(None);
        region.lru_next.set(None);
        match prev {
            Some(p) => self.region(p).lru_next.set(next),
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.region(n).lru_prev.set(prev),
            None => self.lru_tail = prev,
        }
        self.unused_count -= 1;
    }

    /// Least recently used region, the eviction candidate.
    pub(crate) fn lru_front(&self) -> Option<usize> {
        self.lru_head
    }

    pub(crate) fn unused_count(&self) -> usize {
        self.unused_count
    }

    // ------------------------------------------------------------------
    // Free multiset
    // ------------------------------------------------------------------

    fn insert_free(&mut self, slot: usize) {
        let size = {
            let region = self.region(slot);
            debug_assert!(!region.in_free.get() && !region.in_unused.get());
            region.in_free.set(true);
            region.size()
        };
        let inserted = self.free_by_size.insert((size, slot));
        debug_assert!(inserted);
    }

    pub(crate) fn remove_free(&mut self, slot: usize) {
        let size = self.region(slot).size();
        let removed = self.free_by_size.remove(&(size, slot));
        debug_assert!(removed, "free multiset out of sync with region size");
        self.region(slot).in_free.set(false);
    }

    /// Smallest free region with size >= `size`.
    pub(crate) fn best_fit(&self, size: usize) -> Option<usize> {
        self.free_by_size
            .range((size, 0)..)
            .next()
            .map(|&(_, slot)| slot)
    }

    /// Any free region, for draining.
    pub(crate) fn any_free(&self) -> Option<usize> {
        self.free_by_size.iter().next().map(|&(_, slot)| slot)
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free_by_size.len()
    }

    // ------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------

    /// Register a freshly mapped chunk and cover it with a single free
    /// region. Returns the slot of that region.
    pub(crate) fn add_chunk(&mut self, chunk: MemoryChunk) -> usize {
        let boxed = Box::new(chunk);
        let chunk_ptr = NonNull::from(boxed.as_ref());
        let base = boxed.base();
        let size = boxed.size();
        self.chunks.push(boxed);

        let slot = self.insert_region(RegionMetadata::new(base, size, chunk_ptr));
        self.push_back_all(slot);
        self.insert_free(slot);
        slot
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Drop every chunk no region pins. Returns the number of bytes released.
    /// All free and unused regions must have been disposed beforehand.
    pub(crate) fn release_unpinned_chunks(&mut self) -> usize {
        let mut released = 0;
        let chunks = std::mem::take(&mut self.chunks);
        for chunk in chunks {
            if chunk.pins() == 0 {
                released += chunk.size();
                // Box drop unmaps and reports.
            } else {
                self.chunks.push(chunk);
            }
        }
        released
    }

    // ------------------------------------------------------------------
    // Carving and coalescing
    // ------------------------------------------------------------------

    /// Carve `size` bytes from the head of free region `slot`.
    ///
    /// On return the carved region is linked in the adjacency list only
    /// (allocated, uninitialized); any remainder stays in the free multiset.
    /// Returns the slot of the carved region.
    pub(crate) fn carve_from_free(&mut self, slot: usize, size: usize) -> usize {
        self.remove_free(slot);

        let region = self.region(slot);
        let free_size = region.size();
        debug_assert!(free_size >= size);

        if free_size == size {
            // Consumed wholly: no residual region. The occupant changes, so
            // stale references from the region's previous life must die.
            self.bump_gen(slot);
            return slot;
        }

        let base = region.ptr();
        let chunk = region.chunk_ptr();

        // Chop the head off; the shrunken tail goes back to the multiset
        // under its new size.
        // Safety: size < free_size, so the advanced pointer stays inside the
        // region's chunk.
        region.set_span(unsafe { base.add(size) }, free_size - size);

        let new_slot = self.insert_region(RegionMetadata::new(base, size, chunk));
        self.insert_all_before(new_slot, slot);
        self.insert_free(slot);
        new_slot
    }

    /// Insert `slot` into the free multiset, absorbing free same-chunk
    /// neighbours on both sides.
    ///
    /// The region must be linked in the adjacency list and nothing else, with
    /// key and value uninitialized.
    pub(crate) fn free_and_coalesce(&mut self, slot: usize) {
        debug_assert!(!self.region(slot).in_free.get() && !self.region(slot).in_unused.get());
        debug_assert!(!self.region(slot).value_initialized());
        let chunk = self.region(slot).chunk_ptr();

        // Absorb the left neighbour: the span grows downwards.
        if let Some(left) = self.all_prev(slot) {
            let left_region = self.region(left);
            if left_region.chunk_ptr() == chunk && left_region.in_free.get() {
                let left_ptr = left_region.ptr();
                let left_size = left_region.size();
                self.remove_free(left);
                self.unlink_all(left);
                self.dispose(left);

                let region = self.region(slot);
                region.set_span(left_ptr, region.size() + left_size);
            }
        }

        // Absorb the right neighbour: the span grows upwards.
        if let Some(right) = self.all_next(slot) {
            let right_region = self.region(right);
            if right_region.chunk_ptr() == chunk && right_region.in_free.get() {
                let right_size = right_region.size();
                self.remove_free(right);
                self.unlink_all(right);
                self.dispose(right);

                let region = self.region(slot);
                region.set_span(region.ptr(), region.size() + right_size);
            }
        }

        self.insert_free(slot);
    }

    /// Bundle everything a producer needs to initialize a carved region.
    pub(crate) fn allocation(&self, slot: usize) -> Allocation<K, V> {
        let region = self.region(slot);
        Allocation {
            rref: self.make_ref(slot),
            region: NonNull::from(region),
            ptr: region.ptr(),
            size: region.size(),
        }
    }

    // ------------------------------------------------------------------
    // Invariant validation (debug builds and tests)
    // ------------------------------------------------------------------

    /// Check that the three indexes agree with every region's state and that
    /// the adjacency list tiles each chunk.
    ///
    /// `strict_tiling` additionally asserts gap-free coverage; it is relaxed
    /// after a shrink left pinned chunks behind with their free regions
    /// disposed.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn validate(&self, strict_tiling: bool) {
        let cap = self.slots.len();
        let mut seen_all = FixedBitSet::with_capacity(cap);
        let mut visited_chunks: Vec<NonNull<MemoryChunk>> = Vec::new();

        // (chunk, expected next address, chunk end)
        let mut cursor: Option<(NonNull<MemoryChunk>, usize, usize)> = None;
        let mut prev_free = false;
        let mut walked = 0usize;
        let mut iter = self.all_head;
        let mut prev_slot: Option<usize> = None;

        while let Some(slot) = iter {
            assert!(
                !seen_all.contains(slot),
                "adjacency list visits slot {slot} twice"
            );
            seen_all.insert(slot);

            let region = self.region(slot);
            assert_eq!(region.all_prev.get(), prev_slot, "broken adjacency back-link");

            let chunk = region.chunk_ptr();
            let start = region.ptr().as_ptr() as usize;
            let size = region.size();
            let chunk_base = region.chunk().base().as_ptr() as usize;
            let chunk_end = chunk_base + region.chunk().size();
            assert!(size > 0, "zero-size region");
            assert!(
                start >= chunk_base && start + size <= chunk_end,
                "region escapes its chunk"
            );

            match cursor {
                Some((cur_chunk, expected, _)) if cur_chunk == chunk => {
                    if strict_tiling {
                        assert_eq!(start, expected, "gap or overlap inside chunk");
                    } else {
                        assert!(start >= expected, "regions overlap");
                    }
                    assert!(
                        !(prev_free && region.in_free.get()),
                        "two adjacent free regions left uncoalesced"
                    );
                }
                other => {
                    if let Some((cur_chunk, expected, cur_end)) = other {
                        if strict_tiling {
                            assert_eq!(expected, cur_end, "chunk not tiled to its end");
                        }
                        visited_chunks.push(cur_chunk);
                    }
                    assert!(
                        !visited_chunks.contains(&chunk),
                        "one chunk's regions are not contiguous in the adjacency list"
                    );
                    if strict_tiling {
                        assert_eq!(start, chunk_base, "chunk not tiled from its base");
                    }
                }
            }

            cursor = Some((chunk, start + size, chunk_end));
            prev_free = region.in_free.get();
            walked += 1;
            prev_slot = Some(slot);
            iter = region.all_next.get();
        }
        if let Some((cur_chunk, expected, cur_end)) = cursor {
            if strict_tiling {
                assert_eq!(expected, cur_end, "last chunk not tiled to its end");
            }
            visited_chunks.push(cur_chunk);
        }
        assert_eq!(walked, self.region_count, "adjacency list count mismatch");
        assert_eq!(self.all_tail, prev_slot, "broken adjacency tail");
        if strict_tiling {
            assert_eq!(
                visited_chunks.len(),
                self.chunks.len(),
                "chunk without regions"
            );
        }

        // Free multiset vs flags and sizes.
        let mut free_seen = FixedBitSet::with_capacity(cap);
        for &(size, slot) in &self.free_by_size {
            assert!(!free_seen.contains(slot), "slot {slot} twice in free multiset");
            free_seen.insert(slot);
            let region = self.region(slot);
            assert!(seen_all.contains(slot));
            assert_eq!(region.size(), size, "free multiset key out of date");
            assert!(
                !region.key_initialized() && !region.value_initialized(),
                "free region holds a key or value"
            );
        }

        // LRU list vs flags.
        let mut unused_seen = FixedBitSet::with_capacity(cap);
        let mut lru_iter = self.lru_head;
        let mut lru_prev: Option<usize> = None;
        let mut lru_walked = 0usize;
        while let Some(slot) = lru_iter {
            assert!(!unused_seen.contains(slot), "slot {slot} twice in LRU list");
            unused_seen.insert(slot);
            let region = self.region(slot);
            assert_eq!(region.lru_prev.get(), lru_prev, "broken LRU back-link");
            assert!(seen_all.contains(slot));
            assert!(
                region.key_initialized() && region.value_initialized(),
                "unused region missing its key or value"
            );
            lru_walked += 1;
            lru_prev = Some(slot);
            lru_iter = region.lru_next.get();
        }
        assert_eq!(lru_walked, self.unused_count, "LRU count mismatch");
        assert_eq!(self.lru_tail, lru_prev, "broken LRU tail");

        // Per-slot membership flags agree with the indexes, and no region is
        // both free and evictable.
        for slot in 0..cap {
            if self.slots[slot].region.is_none() {
                continue;
            }
            let region = self.region(slot);
            assert!(
                seen_all.contains(slot),
                "region slot {slot} missing from the adjacency list"
            );
            assert_eq!(region.in_free.get(), free_seen.contains(slot));
            assert_eq!(region.in_unused.get(), unused_seen.contains(slot));
            assert!(!(region.in_free.get() && region.in_unused.get()));
        }
    }

    /// Sum of region sizes for which `pred` holds, walking the adjacency
    /// list. Validation helper.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn sum_sizes<F: Fn(&RegionMetadata<K, V>) -> bool>(&self, pred: F) -> usize {
        let mut total = 0;
        let mut iter = self.all_head;
        while let Some(slot) = iter {
            let region = self.region(slot);
            if pred(region) {
                total += region.size();
            }
            iter = region.all_next.get();
        }
        total
    }

    /// Number of regions for which `pred` holds. Validation helper.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn count_regions<F: Fn(&RegionMetadata<K, V>) -> bool>(&self, pred: F) -> usize {
        let mut count = 0;
        let mut iter = self.all_head;
        while let Some(slot) = iter {
            let region = self.region(slot);
            if pred(region) {
                count += 1;
            }
            iter = region.all_next.get();
        }
        count
    }

    #[cfg(any(test, debug_assertions))]
    pub(crate) fn chunks_total_size(&self) -> usize {
        self.chunks.iter().map(|c| c.size()).sum()
    }
}

impl<K, V> Drop for RegionTables<K, V> {
    fn drop(&mut self) {
        // Region metadata (and the values inside, which may point into the
        // mapped payload) must be destroyed before the chunks are unmapped.
        for slot in &mut self.slots {
            drop(slot.region.take());
        }
        self.chunks.clear();
    }
}
