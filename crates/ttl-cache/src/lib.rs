//! An LRU cache whose entries carry an expiration time, with a
//! single-flight `get_or_try_insert` so that concurrent lookups of the
//! same key share one computation instead of stampeding the backend.
use lru_cache::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry<V> {
    item: V,
    expiration: Instant,
}

/// The result of a cache lookup or populate.
#[derive(Debug)]
pub struct CachedValue<V> {
    pub item: V,
    pub expiration: Instant,
    /// false when the value was served from cache
    pub is_fresh: bool,
}

pub struct TtlCache<K: Hash + Eq + Clone, V: Clone> {
    name: &'static str,
    cache: Mutex<LruCache<K, Entry<V>>>,
    flights: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            cache: Mutex::new(LruCache::new(capacity)),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lookup an unexpired entry. An expired entry is removed as a side
    /// effect, so the cache never returns a value past its expiration.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lookup(key).map(|cached| cached.item)
    }

    pub fn lookup(&self, key: &K) -> Option<CachedValue<V>> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(key)?;
        if Instant::now() < entry.expiration {
            Some(CachedValue {
                item: entry.item.clone(),
                expiration: entry.expiration,
                is_fresh: false,
            })
        } else {
            cache.remove(key);
            None
        }
    }

    pub fn insert(&self, key: K, item: V, expiration: Instant) -> V {
        self.cache.lock().insert(
            key,
            Entry {
                item: item.clone(),
                expiration,
            },
        );
        item
    }

    pub fn clear(&self) -> usize {
        let mut cache = self.cache.lock();
        let num_entries = cache.len();
        cache.clear();
        num_entries
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get an existing item, or run `fut` to produce one and insert it.
    ///
    /// Concurrent callers with the same key are coalesced: one runs the
    /// future, the rest wait and then read the freshly inserted value.
    /// `ttl_fn` maps the computed value to its time-to-live, which allows
    /// error values to be cached for a shorter period than successes.
    pub async fn get_or_try_insert<E, TTL, Fut>(
        &self,
        key: &K,
        ttl_fn: TTL,
        fut: Fut,
    ) -> Result<CachedValue<V>, E>
    where
        TTL: FnOnce(&V) -> Duration,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(cached) = self.lookup(key) {
            return Ok(cached);
        }

        let flight = self
            .flights
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let _guard = flight.lock().await;

        // Someone else may have populated the entry while we waited
        // for the flight lock.
        if let Some(cached) = self.lookup(key) {
            return Ok(cached);
        }

        let result = fut.await;
        self.flights.lock().remove(key);

        let item = result?;
        let expiration = Instant::now() + ttl_fn(&item);
        self.insert(key.clone(), item.clone(), expiration);
        Ok(CachedValue {
            item,
            expiration,
            is_fresh: true,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn expired_entries_are_not_returned() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", 8);
        cache.insert("a".to_string(), 1, Instant::now() + Duration::from_secs(60));
        cache.insert("b".to_string(), 2, Instant::now() - Duration::from_secs(1));

        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
        // the expired entry was evicted by the failed lookup
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lru_capacity_is_bounded() {
        let cache: TtlCache<u32, u32> = TtlCache::new("test", 2);
        let far = Instant::now() + Duration::from_secs(60);
        cache.insert(1, 1, far);
        cache.insert(2, 2, far);
        cache.insert(3, 3, far);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_lookups() {
        let cache: Arc<TtlCache<String, u32>> = Arc::new(TtlCache::new("test", 8));
        let computed = Arc::new(AtomicUsize::new(0));

        let mut tasks = vec![];
        for _ in 0..8 {
            let cache = cache.clone();
            let computed = computed.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert(
                        &"key".to_string(),
                        |_| Duration::from_secs(60),
                        async {
                            computed.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<u32, ()>(42)
                        },
                    )
                    .await
                    .unwrap()
                    .item
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 42);
        }
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", 8);
        let err = cache
            .get_or_try_insert(&"key".to_string(), |_| Duration::from_secs(60), async {
                Err::<u32, String>("boom".to_string())
            })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");

        let ok = cache
            .get_or_try_insert(&"key".to_string(), |_| Duration::from_secs(60), async {
                Ok::<u32, String>(7)
            })
            .await
            .unwrap();
        assert!(ok.is_fresh);
        assert_eq!(ok.item, 7);
    }
}
