use std::collections::HashMap;
use std::hash::Hash;

use super::handle::ValueHandle;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex};

/// Guarded state of one insertion attempt.
pub(crate) struct AttemptState<K: Ord + Hash + Clone, V> {
    /// Set once the attempt has been removed from the registry; late holders
    /// must not touch the registry again.
    pub(crate) is_disposed: bool,
    /// The produced handle, published by the winning producer for every
    /// sibling that queued up behind the attempt mutex.
    pub(crate) value: Option<ValueHandle<K, V>>,
}

/// A per-key rendezvous token serializing competing producers.
///
/// Threads that miss the cache for the same key share one attempt: the first
/// to take the attempt mutex produces the value, the rest find it published
/// and count as concurrent hits. A producer that fails leaves the attempt
/// empty so the next sibling retries with its own callbacks.
pub(crate) struct InsertionAttempt<K: Ord + Hash + Clone, V> {
    pub(crate) state: Mutex<AttemptState<K, V>>,
    /// How many guards currently hold this attempt.
    refcount: AtomicUsize,
}

impl<K: Ord + Hash + Clone, V> InsertionAttempt<K, V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(AttemptState {
                is_disposed: false,
                value: None,
            }),
            refcount: AtomicUsize::new(0),
        }
    }
}

/// Registry of in-flight attempts, keyed by the cache key.
pub(crate) struct AttemptRegistry<K: Ord + Hash + Clone, V> {
    map: Mutex<HashMap<K, Arc<InsertionAttempt<K, V>>>>,
}

impl<K: Ord + Hash + Clone, V> AttemptRegistry<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Join (or start) the attempt for `key`. The returned guard keeps the
    /// attempt registered until the last holder drops it.
    pub(crate) fn acquire<'a>(&'a self, key: &K) -> AttemptGuard<'a, K, V> {
        let mut map = self.map.lock().unwrap();
        let attempt = map
            .entry(key.clone())
            .or_insert_with(|| Arc::new(InsertionAttempt::new()))
            .clone();
        attempt.refcount.fetch_add(1, Ordering::Relaxed);
        AttemptGuard {
            registry: self,
            key: key.clone(),
            attempt,
        }
    }

    /// Drop every registered attempt. Outstanding guards see their attempt
    /// disposed and release without touching the registry.
    pub(crate) fn clear(&self) {
        let mut map = self.map.lock().unwrap();
        for (_, attempt) in map.drain() {
            attempt.state.lock().unwrap().is_disposed = true;
        }
    }

    #[cfg(any(test, debug_assertions))]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

/// RAII holder of one reference to an insertion attempt.
///
/// The holder whose release drops the attempt's refcount to zero removes the
/// entry from the registry, taking the registry mutex first and the attempt
/// mutex second, never the other way around.
pub(crate) struct AttemptGuard<'a, K: Ord + Hash + Clone, V> {
    registry: &'a AttemptRegistry<K, V>,
    key: K,
    attempt: Arc<InsertionAttempt<K, V>>,
}

impl<K: Ord + Hash + Clone, V> AttemptGuard<'_, K, V> {
    pub(crate) fn attempt(&self) -> &InsertionAttempt<K, V> {
        &self.attempt
    }
}

impl<K: Ord + Hash + Clone, V> Drop for AttemptGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.attempt.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Possibly the last holder. Re-check under the registry lock: a new
        // thread may have joined between the decrement and here.
        let mut map = self.registry.map.lock().unwrap();
        if self.attempt.refcount.load(Ordering::Relaxed) != 0 {
            return;
        }
        let mut state = self.attempt.state.lock().unwrap();
        if state.is_disposed {
            return;
        }
        state.is_disposed = true;
        if let Some(current) = map.get(&self.key) {
            if Arc::ptr_eq(current, &self.attempt) {
                map.remove(&self.key);
            }
        }
    }
}
