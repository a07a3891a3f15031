//! Generic key→value store with last-access timestamps and sweep-based expiry.
//!
//! A single background task, started at construction, wakes every `ttl` and
//! evicts entries not accessed for at least `ttl`, handing each evicted value
//! to a caller-supplied async hook. The batch sweep is O(n) per tick but
//! avoids a per-entry timer; fine for the bounded entry counts this crate
//! manages (reply destinations).
//!
//! Eviction precision is deliberately loose: an entry last touched at T is
//! purged somewhere in [T+ttl, T+2·ttl) depending on sweep phase. Callers
//! must not assume tight TTL timing.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::macros::log_debug;

/// Boxed future, used for type-erased async callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Async eviction hook, invoked once per purged entry.
pub type PurgeHook<K, V> = Arc<dyn Fn(K, V) -> BoxFuture<'static, ()> + Send + Sync>;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Poisoning means another task panicked while holding the lock. The state
/// guarded in this crate is best-effort bookkeeping (cache entries, pending
/// maps) with no invariants spanning multiple fields, so continuing with the
/// inner value is safe; the worst outcome is a dropped entry.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct CacheEntry<V> {
    value: V,
    last_accessed: Instant,
}

type EntryMap<K, V> = Arc<Mutex<HashMap<K, CacheEntry<V>>>>;

/// TTL cache with periodic background expiry.
///
/// `get` refreshes an entry's timestamp; the sweep never resets on access,
/// it simply ticks every `ttl` from construction.
pub struct Cache<K, V> {
    entries: EntryMap<K, V>,

    /// Sweep task handle. The task holds only a `Weak` to the entry map and
    /// exits on its next tick after the cache is dropped.
    _sweep_task: JoinHandle<()>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a cache sweeping every `ttl`, with `purged` invoked for each
    /// evicted entry.
    pub fn new(ttl: Duration, purged: PurgeHook<K, V>) -> Self {
        // ---
        let entries: EntryMap<K, V> = Arc::new(Mutex::new(HashMap::new()));
        let weak = Arc::downgrade(&entries);

        let sweep_task = tokio::spawn(async move {
            // ---
            loop {
                time::sleep(ttl).await;

                let Some(entries) = weak.upgrade() else {
                    // Cache was dropped, exit loop
                    break;
                };

                let stale: Vec<(K, V)> = {
                    let mut map = lock_ignore_poison(&entries);
                    let keys: Vec<K> = map
                        .iter()
                        .filter(|(_, entry)| entry.last_accessed.elapsed() >= ttl)
                        .map(|(key, _)| key.clone())
                        .collect();

                    keys.into_iter()
                        .filter_map(|key| map.remove(&key).map(|entry| (key, entry.value)))
                        .collect()
                };
                drop(entries);

                for (key, value) in stale {
                    log_debug!("cache: purging stale entry");
                    purged(key, value).await;
                }
            }
        });

        Self {
            entries,
            _sweep_task: sweep_task,
        }
    }

    /// Store or overwrite a value with a fresh access timestamp.
    pub fn put(&self, key: K, value: V) {
        // ---
        let mut map = lock_ignore_poison(&self.entries);
        map.insert(
            key,
            CacheEntry {
                value,
                last_accessed: Instant::now(),
            },
        );
    }

    /// Look up a value, refreshing its access timestamp on hit.
    ///
    /// Absent keys return `None` and create nothing.
    pub fn get(&self, key: &K) -> Option<V> {
        // ---
        let mut map = lock_ignore_poison(&self.entries);
        map.get_mut(key).map(|entry| {
            entry.last_accessed = Instant::now();
            entry.value.clone()
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.entries).len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_millis(100);

    fn counting_hook(counter: Arc<AtomicUsize>) -> PurgeHook<String, u32> {
        // ---
        Arc::new(move |_key, _value| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    // Yield so the sweep task can run: register its first timer after
    // construction, or observe an advanced clock.
    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn get_absent_returns_none_without_creating() {
        // ---
        let purges = Arc::new(AtomicUsize::new(0));
        let cache: Cache<String, u32> = Cache::new(TTL, counting_hook(purges));

        assert_eq!(cache.get(&"missing".to_string()), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn put_then_get_returns_value() {
        // ---
        let purges = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(TTL, counting_hook(purges));

        cache.put("k".to_string(), 42);
        assert_eq!(cache.get(&"k".to_string()), Some(42));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_purged_exactly_once() {
        // ---
        let purges = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(TTL, counting_hook(purges.clone()));

        cache.put("k".to_string(), 1);
        settle().await;

        // Guaranteed evicted by the second sweep after T+ttl.
        time::advance(TTL * 2 + Duration::from_millis(5)).await;
        settle().await;

        assert_eq!(cache.get(&"k".to_string()), None);
        assert_eq!(purges.load(Ordering::SeqCst), 1);

        // No further hook invocations on later sweeps.
        time::advance(TTL * 2).await;
        settle().await;
        assert_eq!(purges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn access_refreshes_ttl() {
        // ---
        let purges = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(TTL, counting_hook(purges.clone()));

        cache.put("k".to_string(), 1);
        settle().await;

        // Touch the entry just before the first sweep.
        time::advance(TTL - Duration::from_millis(10)).await;
        assert_eq!(cache.get(&"k".to_string()), Some(1));

        // First sweep: entry was accessed 10ms ago, survives.
        time::advance(Duration::from_millis(15)).await;
        settle().await;
        assert_eq!(purges.load(Ordering::SeqCst), 0);
        assert_eq!(cache.len(), 1);

        // Second sweep: no access since, evicted.
        time::advance(TTL).await;
        settle().await;
        assert_eq!(purges.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_not_evicted_before_ttl() {
        // ---
        let purges = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(TTL, counting_hook(purges.clone()));

        cache.put("k".to_string(), 1);
        settle().await;

        time::advance(TTL / 2).await;
        settle().await;

        assert_eq!(purges.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get(&"k".to_string()), Some(1));
    }
}
