use dashmap::DashMap;
use lru_cache::LruCache;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone)]
struct Item<V> {
    item: V,
    expiration: Instant,
}

/// The result of a cache lookup or population.
/// `is_fresh` is true when the item was produced by the caller-supplied
/// future rather than satisfied from the cache.
#[derive(Debug, Clone)]
pub struct Lookup<V> {
    pub item: V,
    pub expiration: Instant,
    pub is_fresh: bool,
}

struct Inner<K: Hash + Eq, V: Clone> {
    name: String,
    cache: Mutex<LruCache<K, Item<V>>>,
    // Per-key population locks; this is what coalesces concurrent
    // get_or_try_insert calls for the same key onto a single future.
    pending: DashMap<K, Arc<AsyncMutex<()>>>,
}

/// A bounded LRU cache whose entries carry an expiration time, with
/// single-flight population semantics for async producers.
pub struct LruCacheWithTtl<K: Hash + Eq, V: Clone> {
    inner: Arc<Inner<K, V>>,
}

impl<K: Hash + Eq + Clone + Send + Sync + 'static, V: Clone + Send + 'static> LruCacheWithTtl<K, V> {
    pub fn new_named<S: Into<String>>(name: S, capacity: usize) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            cache: Mutex::new(LruCache::new(capacity)),
            pending: DashMap::new(),
        });
        tracing::debug!("cache {} created with capacity {capacity}", inner.name);
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn clear(&self) -> usize {
        let mut cache = self.inner.cache.lock();
        let num_entries = cache.len();
        cache.clear();
        num_entries
    }

    pub fn get<Q: ?Sized>(&self, name: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.lookup(name).map(|lookup| lookup.item)
    }

    /// Like `get`, but also reports the expiration time of the entry.
    pub fn lookup<Q: ?Sized>(&self, name: &Q) -> Option<Lookup<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let mut cache = self.inner.cache.lock();
        let entry = cache.get_mut(name)?;
        if Instant::now() < entry.expiration {
            Some(Lookup {
                item: entry.item.clone(),
                expiration: entry.expiration,
                is_fresh: false,
            })
        } else {
            cache.remove(name);
            None
        }
    }

    pub fn insert(&self, name: K, item: V, expiration: Instant) -> V {
        self.inner.cache.lock().insert(
            name,
            Item {
                item: item.clone(),
                expiration,
            },
        );
        item
    }

    /// Infallible variant of `get_or_try_insert`.
    pub async fn get_or_insert_with<TTL, Fut>(&self, key: &K, ttl_fn: TTL, fut: Fut) -> Lookup<V>
    where
        TTL: FnOnce(&V) -> Duration,
        Fut: Future<Output = V>,
    {
        match self
            .get_or_try_insert(key, ttl_fn, async { Ok::<V, std::convert::Infallible>(fut.await) })
            .await
        {
            Ok(lookup) => lookup,
            Err(infallible) => match infallible {},
        }
    }

    /// Get an existing unexpired item, or run `fut` to produce one and
    /// insert it. Concurrent callers for the same key are coalesced onto a
    /// single execution of `fut`; the others wait and then read the cached
    /// value. `ttl_fn` computes the entry lifetime from the produced value,
    /// which allows negative results to be cached with a shorter TTL.
    /// An Err from `fut` is returned to the caller and nothing is cached.
    pub async fn get_or_try_insert<E, TTL, Fut>(
        &self,
        key: &K,
        ttl_fn: TTL,
        fut: Fut,
    ) -> Result<Lookup<V>, E>
    where
        TTL: FnOnce(&V) -> Duration,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }

        let lock = self
            .inner
            .pending
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Someone else may have populated while we waited for the lock
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }

        let result = fut.await;
        self.inner.pending.remove(key);

        match result {
            Ok(item) => {
                let expiration = Instant::now() + ttl_fn(&item);
                self.insert(key.clone(), item.clone(), expiration);
                Ok(Lookup {
                    item,
                    expiration,
                    is_fresh: true,
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn expired_entries_are_misses() {
        let cache: LruCacheWithTtl<String, u32> = LruCacheWithTtl::new_named("test", 8);
        cache.insert(
            "soon".to_string(),
            1,
            Instant::now() + Duration::from_millis(20),
        );
        assert_eq!(cache.get("soon"), Some(1));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("soon"), None);
    }

    #[test]
    fn lru_eviction() {
        let cache: LruCacheWithTtl<u32, u32> = LruCacheWithTtl::new_named("evict", 2);
        let later = Instant::now() + Duration::from_secs(60);
        cache.insert(1, 1, later);
        cache.insert(2, 2, later);
        cache.insert(3, 3, later);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(2));
        assert_eq!(cache.get(&3), Some(3));
    }

    #[tokio::test]
    async fn single_flight_population() {
        let cache: Arc<LruCacheWithTtl<String, u32>> =
            Arc::new(LruCacheWithTtl::new_named("flight", 8));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = vec![];
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_try_insert(
                        &"key".to_string(),
                        |_| Duration::from_secs(60),
                        async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<u32, String>(42)
                        },
                    )
                    .await
            }));
        }

        for task in tasks {
            let lookup = task.await.unwrap().unwrap();
            assert_eq!(lookup.item, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: LruCacheWithTtl<String, u32> = LruCacheWithTtl::new_named("err", 8);
        let res = cache
            .get_or_try_insert(&"k".to_string(), |_| Duration::from_secs(60), async {
                Err::<u32, String>("boom".to_string())
            })
            .await;
        assert_eq!(res.unwrap_err(), "boom");

        let res = cache
            .get_or_try_insert(&"k".to_string(), |_| Duration::from_secs(60), async {
                Ok::<u32, String>(7)
            })
            .await
            .unwrap();
        assert!(res.is_fresh);
        assert_eq!(res.item, 7);
    }
}
