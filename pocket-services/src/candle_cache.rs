//! Candle Cache
//!
//! In-memory TTL cache for fetched series. Entries are evicted lazily on
//! lookup once expired. Concurrent misses on the same key collapse into a
//! single upstream fetch; misses on different keys never wait on each other.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use pocket_core::PocketResult;

/// Cached value with its expiry
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
}

type Flights<K> = DashMap<K, Arc<tokio::sync::Mutex<()>>>;

/// One caller's membership in a key's flight
///
/// Leaving the flight, by finishing or by being dropped mid-fetch, removes
/// the key's entry once no other caller holds it.
struct FlightGuard<'a, K: Eq + Hash> {
    flights: &'a Flights<K>,
    key: K,
    flight: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl<'a, K: Eq + Hash + Clone> FlightGuard<'a, K> {
    fn join(flights: &'a Flights<K>, key: &K) -> Self {
        let flight = flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        Self {
            flights,
            key: key.clone(),
            flight: Some(flight),
        }
    }

    /// Wait for this caller's turn on the key
    async fn enter(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.flight {
            Some(flight) => Some(flight.lock().await),
            None => None,
        }
    }
}

impl<K: Eq + Hash> Drop for FlightGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.flight.take());
        // Only the map's handle left: nobody else is queued on this key
        self.flights
            .remove_if(&self.key, |_, f| Arc::strong_count(f) == 1);
    }
}

/// TTL cache with per-key single-flight fetches
pub struct TtlCache<K, V> {
    name: &'static str,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    flights: Flights<K>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
            flights: DashMap::new(),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    /// Fresh value for `key`; an expired entry is removed on the way
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_fresh(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock, a fetch may have refreshed it
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|e| !e.is_fresh(now)) {
            entries.remove(key);
            debug!("[{}] Evicted expired entry {:?}", self.name, key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write();

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, entry| entry.is_fresh(now));
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.write().remove(key);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
        }
    }

    /// Return the cached value or run `fetch` once for every concurrent caller
    ///
    /// Failures are not cached; every waiter that finds no value after the
    /// in-flight fetch fails runs its own attempt.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, ttl: Duration, fetch: F) -> PocketResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PocketResult<V>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let flight = FlightGuard::join(&self.flights, &key);
        let _in_flight = flight.enter().await;

        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let result = fetch().await;
        if let Ok(value) = &result {
            self.insert(key, value.clone(), ttl);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_core::PocketError;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", 8);
        cache.insert("a".to_string(), 1, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let cache: Arc<TtlCache<&'static str, u32>> = Arc::new(TtlCache::new("test", 8));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_fetch("EURUSD_otc", Duration::from_secs(60), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(7)
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.flights.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_leaves_no_flight() {
        let cache: Arc<TtlCache<&'static str, u32>> = Arc::new(TtlCache::new("test", 8));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            cache.get_or_fetch("EURUSD_otc", Duration::from_secs(60), || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1)
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(cache.flights.is_empty());

        // A waiter queued behind an aborted leader still cleans up after itself
        let leader = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move {
                cache
                    .get_or_fetch("GBPUSD_otc", Duration::from_secs(60), || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(1)
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move {
                cache
                    .get_or_fetch("GBPUSD_otc", Duration::from_secs(60), || async { Ok(2) })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());
        assert_eq!(follower.await.unwrap().unwrap(), 2);
        assert!(cache.flights.is_empty());
        assert_eq!(cache.get(&"GBPUSD_otc"), Some(2));
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache: TtlCache<u8, u8> = TtlCache::new("test", 8);
        let err = cache
            .get_or_fetch(1, Duration::from_secs(60), || async {
                Err(PocketError::transient("boom"))
            })
            .await;
        assert!(err.is_err());

        let ok = cache
            .get_or_fetch(1, Duration::from_secs(60), || async { Ok(3) })
            .await;
        assert_eq!(ok.unwrap(), 3);
        assert_eq!(cache.stats().fetches, 2);
    }

    #[test]
    fn test_capacity_evicts_soonest_expiry() {
        let cache: TtlCache<u8, u8> = TtlCache::new("test", 2);
        cache.insert(1, 1, Duration::from_secs(10));
        cache.insert(2, 2, Duration::from_secs(100));
        cache.insert(3, 3, Duration::from_secs(100));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(2));
        assert_eq!(cache.get(&3), Some(3));
    }
}
