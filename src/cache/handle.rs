use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

use super::allocator::{CacheKey, CacheShared};
use super::region::RegionRef;
use crate::sync::Arc;

/// Shared, reference-counted view of one cached value.
///
/// Cloning is O(1). While at least one clone is alive the underlying region
/// is pinned: it can neither be evicted nor shrunk away, and `Deref` stays
/// valid. Dropping the last clone releases the region back to the evictable
/// set.
pub struct ValueHandle<K: CacheKey, V> {
    core: Arc<HandleCore<K, V>>,
}

struct HandleCore<K: CacheKey, V> {
    cache: Arc<CacheShared<K, V>>,
    region: RegionRef,
    value: NonNull<V>,
}

// Safety: the value pointer targets storage owned by the cache that stays
// valid while this core pins it; access to the value itself is shared-only.
unsafe impl<K: CacheKey + Send + Sync, V: Send + Sync> Send for HandleCore<K, V> {}
// Safety: `Deref` hands out only `&V`.
unsafe impl<K: CacheKey + Send + Sync, V: Send + Sync> Sync for HandleCore<K, V> {}

impl<K: CacheKey, V> ValueHandle<K, V> {
    pub(crate) fn new(
        cache: Arc<CacheShared<K, V>>,
        region: RegionRef,
        value: NonNull<V>,
    ) -> Self {
        Self {
            core: Arc::new(HandleCore {
                cache,
                region,
                value,
            }),
        }
    }
}

impl<K: CacheKey, V> Clone for ValueHandle<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K: CacheKey, V> Deref for ValueHandle<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        // Safety: the region is pinned for the lifetime of this core, and the
        // value cell is never written while its refcount is non-zero.
        unsafe { self.core.value.as_ref() }
    }
}

impl<K: CacheKey, V: fmt::Debug> fmt::Debug for ValueHandle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueHandle").field(&**self).finish()
    }
}

impl<K: CacheKey, V> Drop for HandleCore<K, V> {
    fn drop(&mut self) {
        // Last handle for this value: run the release hook.
        self.cache.release_value(self.region);
    }
}
