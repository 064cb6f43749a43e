#[cfg(all(test, not(loom)))]
mod tests {
    use std::time::Duration;

    use crate::cache::allocator::{CacheConfig, SlabCache};
    use crate::cache::error::CacheError;
    use crate::cache::vm::{PlatformVmOps, VmOps};
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;
    use crate::sync::Arc;

    fn page() -> usize {
        PlatformVmOps::page_size()
    }

    fn cache(budget: usize, min_chunk: usize) -> SlabCache<u64, u64> {
        SlabCache::with_config(
            budget,
            CacheConfig {
                min_chunk_size: min_chunk,
                value_alignment: 8,
                ..CacheConfig::default()
            },
        )
        .unwrap()
    }

    /// Deterministic xorshift64*; no external RNG in tests.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            self.0 = x;
            x.wrapping_mul(0x2545_F491_4F6C_DD1D)
        }

        fn below(&mut self, bound: u64) -> u64 {
            self.next() % bound
        }
    }

    #[test]
    fn test_integration_stampede_single_producer() {
        let _guard = crate::cache::TEST_MUTEX.read().unwrap();
        // X1: many threads, one key, slow initializer. The attempt protocol
        // must let exactly one initializer run.
        let cache = Arc::new(cache(page() * 4, page()));
        let init_calls = Arc::new(AtomicUsize::new(0));

        let num_threads = 8usize;
        let iters = 200usize;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let cache = cache.clone();
                let init_calls = init_calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..iters {
                        let (handle, _) = cache
                            .get_or_set(
                                &42,
                                || Ok(64),
                                |_| {
                                    init_calls.fetch_add(1, Ordering::Relaxed);
                                    thread::yield_now();
                                    std::thread::sleep(Duration::from_millis(25));
                                    Ok(420)
                                },
                            )
                            .unwrap();
                        let handle = handle.expect("budget fits a single value");
                        assert_eq!(*handle, 420);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = cache.stats();
        // The value is never evicted (the budget holds it comfortably), so
        // the initializer ran once for the whole run.
        assert_eq!(init_calls.load(Ordering::Relaxed), stats.evictions + 1);
        assert_eq!(init_calls.load(Ordering::Relaxed), 1);
        assert!(stats.concurrent_hits > 0, "no rendezvous was observed");
        assert_eq!(stats.hits + stats.misses, num_threads * iters);
        assert!(stats.concurrent_hits <= stats.hits);
        cache.validate_quiescent();
    }

    #[test]
    fn test_integration_pinned_handle_survives_evictions() {
        let _guard = crate::cache::TEST_MUTEX.read().unwrap();
        // X2: a pinned value must keep its contents across arbitrary churn.
        let cache = cache(page(), page());

        let (pinned, _) = cache.get_or_set(&0, || Ok(64), |_| Ok(1234)).unwrap();
        let pinned = pinned.expect("first insert fits");

        for key in 1..200u64 {
            // Churn: every other value is released immediately and becomes
            // eviction fodder.
            let _ = cache
                .get_or_set(&key, || Ok(256), |_| Ok(key))
                .unwrap();
            assert_eq!(*pinned, 1234, "pinned value changed during churn");
        }

        let stats = cache.stats();
        assert!(stats.evictions > 0, "churn never evicted anything");
        // The pinned key was never touched.
        assert!(cache.get(&0).is_some());
        assert_eq!(*pinned, 1234);
        cache.validate_quiescent();
    }

    #[test]
    fn test_integration_randomized_op_sequence_holds_invariants() {
        let _guard = crate::cache::TEST_MUTEX.read().unwrap();
        // X3: a few hundred random operations; the index/gauge invariants
        // must hold after every single one.
        let cache = cache(page() * 4, page());
        let mut rng = Rng(0x8228_55A2_D57E_1886);
        let mut held: Vec<(u64, crate::cache::handle::ValueHandle<u64, u64>)> = Vec::new();

        for _ in 0..400 {
            match rng.below(100) {
                0..=49 => {
                    let key = rng.below(64);
                    let size = 8 + rng.below(page() as u64 / 2) as usize;
                    let (handle, _) = cache
                        .get_or_set(&key, || Ok(size), |_| Ok(key.wrapping_mul(3)))
                        .unwrap();
                    if let Some(handle) = handle {
                        assert_eq!(*handle, key.wrapping_mul(3));
                        if rng.below(2) == 0 {
                            held.push((key, handle));
                        }
                    }
                }
                50..=69 => {
                    let key = rng.below(64);
                    if let Some(handle) = cache.get(&key) {
                        assert_eq!(*handle, key.wrapping_mul(3));
                    }
                }
                70..=89 => {
                    if !held.is_empty() {
                        let idx = rng.below(held.len() as u64) as usize;
                        held.swap_remove(idx);
                    }
                }
                90..=94 => {
                    cache.shrink_to_fit(false);
                    // Shrink must never disturb pinned values.
                    for (key, handle) in &held {
                        assert_eq!(**handle, key.wrapping_mul(3));
                    }
                }
                _ => {
                    held.clear();
                }
            }

            cache.validate_quiescent();
            let stats = cache.stats();
            assert!(stats.chunks_size <= page() * 4);
            assert!(stats.concurrent_hits <= stats.hits);
        }

        held.clear();
        cache.validate_quiescent();
    }

    #[test]
    fn test_integration_thread_contention_distinct_keys() {
        let _guard = crate::cache::TEST_MUTEX.read().unwrap();
        // X4: threads churning overlapping key ranges, dropping handles as
        // they go. Afterwards the cache must be consistent and readable.
        let cache = Arc::new(cache(page() * 4, page()));
        let num_threads = 4usize;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads as u64)
            .map(|t| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..200u64 {
                        let key = (t * 50 + i) % 120;
                        let result = cache
                            .get_or_set(&key, || Ok(64 + (key as usize % 128)), |_| Ok(key + 7))
                            .unwrap();
                        if let (Some(handle), _) = result {
                            assert_eq!(*handle, key + 7);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        cache.validate_quiescent();
        let stats = cache.stats();
        // Every call was either a hit or a miss, nothing double-counted.
        assert_eq!(stats.hits + stats.misses, num_threads * 200);
        assert!(stats.concurrent_hits <= stats.hits);
        assert_eq!(stats.in_use_size, 0, "all handles were dropped");

        // Everything still cached must read back correctly.
        for key in 0..120u64 {
            if let Some(handle) = cache.get(&key) {
                assert_eq!(*handle, key + 7);
            }
        }
        cache.validate_quiescent();
    }

    #[test]
    fn test_integration_failed_init_retried_by_sibling() {
        let _guard = crate::cache::TEST_MUTEX.read().unwrap();
        // X5: producer A fails, producer B retries the same key and wins;
        // the failure never leaks allocation or accounting.
        let cache = Arc::new(cache(page(), page()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let cache = cache.clone();
                let attempts = attempts.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let result = cache.get_or_set(
                        &5,
                        || Ok(64),
                        |_| {
                            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(CacheError::callback("first producer fails"))
                            } else {
                                Ok(55)
                            }
                        },
                    );
                    match result {
                        Ok((Some(handle), _)) => assert_eq!(*handle, 55),
                        Ok((None, _)) => panic!("cache cannot be full here"),
                        Err(e) => assert!(matches!(e, CacheError::Callback(_))),
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        cache.validate_quiescent();

        // Whether the retry happened in parallel or not, a final serial call
        // must observe (or produce) the value.
        let (handle, _) = cache.get_or_set(&5, || Ok(64), |_| Ok(55)).unwrap();
        assert_eq!(*handle.unwrap(), 55);
        assert!(attempts.load(Ordering::SeqCst) >= 1);
        cache.validate_quiescent();
    }

    #[test]
    fn test_integration_shrink_reinsert_roundtrip() {
        let _guard = crate::cache::TEST_MUTEX.read().unwrap();
        // X6: shrink, then re-insert the same keys; values must equal a
        // fresh initializer run.
        let cache = cache(page() * 2, page());

        for key in 0..16u64 {
            let _ = cache.get_or_set(&key, || Ok(128), |_| Ok(key * 11)).unwrap();
        }
        cache.shrink_to_fit(true);
        assert_eq!(cache.stats().chunks, 0);

        for key in 0..16u64 {
            let (handle, produced) =
                cache.get_or_set(&key, || Ok(128), |_| Ok(key * 11)).unwrap();
            assert!(produced, "shrink must have dropped the cached value");
            assert_eq!(*handle.unwrap(), key * 11);
        }
        cache.validate_quiescent();
    }
}
