//! TTL cache with single-flight population
//!
//! Holds one value tagged with a key (typically a fingerprint of the inputs
//! it was built from). A lookup returns the cached value while it is younger
//! than the TTL and was built for the same key; otherwise it runs the loader.
//!
//! The slot lock is held across the load, so concurrent callers that miss
//! at the same time wait for the one in-flight load and then share its
//! result instead of issuing their own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct CacheEntry<K, V> {
    key: K,
    value: Arc<V>,
    loaded_at: Instant,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    slot: Mutex<Option<CacheEntry<K, V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: PartialEq,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key`, loading it if missing or expired.
    ///
    /// Loader errors are returned to the caller that triggered the load and
    /// leave the slot empty, so the next caller retries.
    pub async fn get_or_try_load<F, Fut, E>(&self, key: K, load: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(entry) = slot.as_ref() {
            if entry.key == key && entry.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&entry.value));
            }
        }

        *slot = None;
        let value = Arc::new(load().await?);
        *slot = Some(CacheEntry {
            key,
            value: Arc::clone(&value),
            loaded_at: Instant::now(),
        });
        Ok(value)
    }

    /// The cached value if it is still fresh, regardless of key.
    pub async fn peek(&self) -> Option<Arc<V>> {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .filter(|entry| entry.loaded_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Drop the cached value; the next lookup reloads.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_load() {
        let cache = Arc::new(TtlCache::<(), u32>::new(Duration::from_secs(60)));
        let loads = Arc::new(AtomicUsize::new(0));

        let lookups = (0..8).map(|_| {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            async move {
                cache
                    .get_or_try_load((), move || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ()>(7)
                    })
                    .await
            }
        });

        let results = futures::future::join_all(lookups).await;
        assert!(results.iter().all(|r| *r.as_ref().unwrap().as_ref() == 7));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_key_change_reload() {
        let cache = TtlCache::<String, u32>::new(Duration::from_secs(30));
        let counter = AtomicUsize::new(0);
        let loads = &counter;
        let load = move || async move { Ok::<_, ()>(loads.fetch_add(1, Ordering::SeqCst) as u32) };

        assert_eq!(*cache.get_or_try_load("a".into(), load).await.unwrap(), 0);
        assert_eq!(*cache.get_or_try_load("a".into(), load).await.unwrap(), 0);

        // Different fingerprint invalidates immediately.
        assert_eq!(*cache.get_or_try_load("b".into(), load).await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.peek().await.is_none());
        assert_eq!(*cache.get_or_try_load("b".into(), load).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_load_error_is_not_cached() {
        let cache = TtlCache::<(), u32>::new(Duration::from_secs(30));

        let err = cache
            .get_or_try_load((), || async { Err::<u32, _>("store down") })
            .await
            .unwrap_err();
        assert_eq!(err, "store down");

        let value = cache
            .get_or_try_load((), || async { Ok::<_, &str>(3) })
            .await
            .unwrap();
        assert_eq!(*value, 3);

        cache.invalidate().await;
        assert!(cache.peek().await.is_none());
    }
}
