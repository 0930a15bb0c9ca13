//! Memoizing key/value cache
//!
//! Each key's value is produced at most once by an async producer. Callers
//! racing on a key that is still being produced await the same in-flight
//! production. Failed productions are not cached, so the next `get` retries.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CacheError;

type Production<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

enum Slot<V> {
    Pending { attempt: u64, production: Production<V> },
    Resolved(V),
}

/// Process-wide memoization store, owned by the composition root
pub struct MemoCache<V> {
    entries: DashMap<String, Slot<V>>,
    attempts: AtomicU64,
}

impl<V> Default for MemoCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemoCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Return the value for `key`, running `producer` only if no value exists
    /// and no production is already in flight.
    ///
    /// The producer is not invoked while any internal lock is held, so it may
    /// itself use the cache.
    pub async fn get<F, Fut>(&self, key: &str, producer: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let (attempt, production) = match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Resolved(value) => return Ok(value.clone()),
                Slot::Pending { attempt, production } => (*attempt, production.clone()),
            },
            Entry::Vacant(entry) => {
                let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
                let production = produce(key.to_string(), producer);
                entry.insert(Slot::Pending {
                    attempt,
                    production: production.clone(),
                });
                tracing::debug!(key, attempt, "Started cache production");
                (attempt, production)
            }
        };

        let outcome = production.await;
        self.settle(key, attempt, &outcome);
        outcome
    }

    /// Discard every entry. Productions still in flight finish for their
    /// current awaiters but are not written back.
    pub fn nuke(&self) {
        self.entries.clear();
        tracing::debug!("Cache nuked");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` holds a resolved value
    pub fn is_resolved(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|slot| matches!(&*slot, Slot::Resolved(_)))
            .unwrap_or(false)
    }

    // Only the attempt that created the slot may resolve or clear it
    fn settle(&self, key: &str, attempt: u64, outcome: &Result<V, CacheError>) {
        match outcome {
            Ok(value) => {
                if let Some(mut slot) = self.entries.get_mut(key) {
                    if is_attempt(&slot, attempt) {
                        *slot = Slot::Resolved(value.clone());
                    }
                }
            }
            Err(e) => {
                let removed = self
                    .entries
                    .remove_if(key, |_, slot| is_attempt(slot, attempt))
                    .is_some();
                if removed {
                    tracing::warn!(key, error = %e, "Cache production failed, key left empty");
                }
            }
        }
    }
}

fn is_attempt<V>(slot: &Slot<V>, attempt: u64) -> bool {
    matches!(slot, Slot::Pending { attempt: current, .. } if *current == attempt)
}

fn produce<V, F, Fut>(key: String, producer: F) -> Production<V>
where
    V: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    async move {
        // The producer is first called on first poll, never under the map lock
        let result = AssertUnwindSafe(async move { producer().await })
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::ProducerFailed {
                key,
                message: format!("{:#}", e),
            }),
            Err(_) => Err(CacheError::ProducerFailed {
                key,
                message: "producer panicked".to_string(),
            }),
        }
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_producer(
        counter: Arc<AtomicUsize>,
        value: u32,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<u32>> + Send + 'static {
        move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_sequential_gets_produce_once() {
        let cache = MemoCache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get("k", counting_producer(counter.clone(), 42, Duration::ZERO))
            .await
            .unwrap();
        let second = cache
            .get("k", counting_producer(counter.clone(), 7, Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(first, 42);
        assert_eq!(second, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cache.is_resolved("k"));
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_production() {
        let cache = Arc::new(MemoCache::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.get("k", counting_producer(counter.clone(), 1, Duration::from_millis(50))),
            cache.get("k", counting_producer(counter.clone(), 2, Duration::from_millis(50))),
        );

        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_gets_across_tasks() {
        let cache = Arc::new(MemoCache::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get("shared", counting_producer(counter, i, Duration::from_millis(20)))
                    .await
            }));
        }

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| *v == values[0]));
    }

    #[tokio::test]
    async fn test_nuke_forces_reproduction() {
        let cache = MemoCache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        cache
            .get("k", counting_producer(counter.clone(), 1, Duration::ZERO))
            .await
            .unwrap();
        cache.nuke();
        assert!(cache.is_empty());

        let value = cache
            .get("k", counting_producer(counter.clone(), 2, Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache: MemoCache<u32> = MemoCache::new();

        let err = cache
            .get("k", || async { Err(anyhow::anyhow!("backend down")) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CacheError::ProducerFailed {
                key: "k".to_string(),
                message: "backend down".to_string(),
            }
        );
        assert!(cache.is_empty());

        let value = cache.get("k", || async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_concurrent_awaiters_share_failure() {
        let cache: Arc<MemoCache<u32>> = Arc::new(MemoCache::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let failing = |counter: Arc<AtomicUsize>| {
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err::<u32, _>(anyhow::anyhow!("boom"))
            }
        };

        let (a, b) = tokio::join!(
            cache.get("k", failing(counter.clone())),
            cache.get("k", failing(counter.clone())),
        );

        assert!(a.is_err());
        assert_eq!(a, b);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_producer_does_not_stick() {
        let cache: MemoCache<u32> = MemoCache::new();

        let err = cache
            .get("k", || async { panic!("producer exploded") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("producer panicked"));

        let value = cache.get("k", || async { Ok(9) }).await.unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn test_nuke_during_production_does_not_write_back() {
        let cache = Arc::new(MemoCache::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let pending = {
            let cache = cache.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                cache
                    .get("k", counting_producer(counter, 1, Duration::from_millis(50)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.nuke();

        // The in-flight caller still receives its value
        assert_eq!(pending.await.unwrap().unwrap(), 1);
        assert!(!cache.is_resolved("k"));

        let value = cache
            .get("k", counting_producer(counter.clone(), 2, Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let cache = MemoCache::new();
        let a = cache.get("a", || async { Ok("alpha".to_string()) }).await.unwrap();
        let b = cache.get("b", || async { Ok("beta".to_string()) }).await.unwrap();

        assert_eq!(a, "alpha");
        assert_eq!(b, "beta");
        assert_eq!(cache.len(), 2);
    }
}
