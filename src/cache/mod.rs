//! Memoization of expensive toolchain queries.
//!
//! Build-settings and simulator-destination lookups each cost a full
//! toolchain round trip, so their results are cached for the lifetime of an
//! orchestrator run. Entries are write-once per key and remember failures as
//! well as successes; a key that failed once replays the same failure
//! without re-invoking the toolchain.
//!
//! Concurrent lookups for the same unseen key collapse into a single
//! in-flight computation: the first caller computes while later callers
//! block on the slot and then read the stored outcome. Distinct keys never
//! contend beyond the brief map access.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-key slot; the outer map hands out one `Arc<Slot>` per key so
/// computation happens outside the map lock.
struct Slot<V, E> {
    outcome: Mutex<Option<Result<V, Arc<E>>>>,
}

/// Write-once memoization keyed by exact match on `K`.
///
/// Two instances exist per orchestrator run: build settings keyed by
/// [`crate::xcode::BuildArguments`], and simulator destination strings keyed
/// by [`crate::xcode::Variant`]. Both are owned by the run, never global.
pub struct QueryCache<K, V, E> {
    slots: Mutex<HashMap<K, Arc<Slot<V, E>>>>,
}

impl<K, V, E> Default for QueryCache<K, V, E> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

fn relock<'a, T>(
    result: Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    // A poisoned slot only means a compute closure panicked; the stored
    // state is still a valid Option.
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K, V, E> QueryCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stored outcome for `key`, computing and storing it on
    /// first use. `compute` runs at most once per key per cache lifetime.
    pub fn get_or_compute<F>(&self, key: &K, compute: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = {
            let mut slots = relock(self.slots.lock());
            Arc::clone(
                slots
                    .entry(key.clone())
                    .or_insert_with(|| {
                        Arc::new(Slot {
                            outcome: Mutex::new(None),
                        })
                    }),
            )
        };

        let mut outcome = relock(slot.outcome.lock());
        if outcome.is_none() {
            *outcome = Some(compute().map_err(Arc::new));
        }
        outcome
            .as_ref()
            .map(|stored| stored.clone())
            .unwrap_or_else(|| unreachable!("outcome populated above"))
    }

    /// Whether an outcome for `key` has been stored.
    pub fn contains(&self, key: &K) -> bool {
        let slots = relock(self.slots.lock());
        slots
            .get(key)
            .map(|slot| relock(slot.outcome.lock()).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_compute_runs_exactly_once_per_key() {
        let cache: QueryCache<String, u32, String> = QueryCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_compute(&"alpha".to_string(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_cached_and_replayed() {
        let cache: QueryCache<u32, u32, String> = QueryCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let err = cache
                .get_or_compute(&1, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("no simulators".to_string())
                })
                .unwrap_err();
            assert_eq!(*err, "no simulators");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distinct_keys_compute_independently() {
        let cache: QueryCache<u32, u32, String> = QueryCache::new();

        assert_eq!(cache.get_or_compute(&1, || Ok::<_, String>(10)).unwrap(), 10);
        assert_eq!(cache.get_or_compute(&2, || Ok::<_, String>(20)).unwrap(), 20);
        assert!(cache.contains(&1));
        assert!(cache.contains(&2));
    }

    #[test]
    fn test_concurrent_same_key_lookups_collapse_to_one_flight() {
        let cache: Arc<QueryCache<u32, u32, String>> = Arc::new(QueryCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(std::thread::spawn(move || {
                cache.get_or_compute(&9, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(100));
                    Ok(42)
                })
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
