/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the attempt rendezvous, the handle release hook and the
/// lookup/release race under every interleaving loom can explore.
///
/// # Design notes
///
///   - Thread counts kept to 2 (state space is exponential).
///   - The VmOps mock under cfg(loom) backs chunks with plain heap memory,
///     so no real mmap happens inside the model.
///   - Caches are built fresh inside every model iteration; the only
///     process-global state (the stats gauges) is loom-lazy-static and
///     resets per run.
///   - The full get_or_set path takes several mutexes in sequence, so the
///     models use a preemption bound to stay tractable.
#[cfg(loom)]
mod tests {
    use crate::cache::allocator::{CacheConfig, SlabCache};
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use crate::sync::Arc;

    fn small_cache() -> SlabCache<u32, u32> {
        SlabCache::with_config(
            4096,
            CacheConfig {
                min_chunk_size: 4096,
                value_alignment: 8,
                ..CacheConfig::default()
            },
        )
        .unwrap()
    }

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    #[test]
    fn loom_stampede_runs_one_initializer() {
        bounded(2).check(|| {
            let cache = Arc::new(small_cache());
            let inits = Arc::new(AtomicUsize::new(0));

            let t = {
                let cache = cache.clone();
                let inits = inits.clone();
                loom::thread::spawn(move || {
                    let (handle, _) = cache
                        .get_or_set(
                            &7,
                            || Ok(64),
                            |_| {
                                inits.fetch_add(1, Ordering::Relaxed);
                                Ok(70)
                            },
                        )
                        .unwrap();
                    assert_eq!(*handle.expect("budget fits one value"), 70);
                })
            };

            let (handle, _) = cache
                .get_or_set(
                    &7,
                    || Ok(64),
                    |_| {
                        inits.fetch_add(1, Ordering::Relaxed);
                        Ok(70)
                    },
                )
                .unwrap();
            assert_eq!(*handle.expect("budget fits one value"), 70);

            t.join().unwrap();
            assert_eq!(inits.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn loom_release_races_lookup() {
        bounded(2).check(|| {
            let cache = Arc::new(small_cache());
            let (handle, produced) = cache.get_or_set(&1, || Ok(64), |_| Ok(11)).unwrap();
            let handle = handle.unwrap();
            assert!(produced);

            let t = loom::thread::spawn(move || {
                drop(handle);
            });

            // The value stays addressable whichever side wins the race: the
            // region is either still pinned or sitting in the unused list.
            let got = cache.get(&1).expect("released values remain cached");
            assert_eq!(*got, 11);

            t.join().unwrap();
            drop(got);
            assert_eq!(cache.stats().in_use_size, 0);
        });
    }

    #[test]
    fn loom_producers_on_distinct_keys() {
        bounded(2).check(|| {
            let cache = Arc::new(small_cache());

            let t = {
                let cache = cache.clone();
                loom::thread::spawn(move || {
                    let (handle, _) = cache.get_or_set(&1, || Ok(64), |_| Ok(10)).unwrap();
                    assert_eq!(*handle.unwrap(), 10);
                })
            };

            let (handle, _) = cache.get_or_set(&2, || Ok(64), |_| Ok(20)).unwrap();
            assert_eq!(*handle.unwrap(), 20);

            t.join().unwrap();
            let stats = cache.stats();
            assert_eq!(stats.misses, 2);
            assert_eq!(stats.concurrent_hits, 0);
        });
    }
}
