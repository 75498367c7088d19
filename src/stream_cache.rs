//! Bounded cache of coalesced fetches.
//!
//! "At-most-one concurrent producer per key, many consumers": N concurrent
//! `get(k)` calls on a cold entry trigger exactly one upstream fetch and all
//! observe the same value. Successful values stay in an LRU of bounded
//! capacity; failures evict the entry so the next caller re-attempts.
//! `invalidate` removes an entry even while its fetch is still in flight; the
//! in-flight result is then discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Upstream producer for cache values.
#[async_trait]
pub trait ValueFetcher<V>: Send + Sync {
    async fn fetch(&self, key: &str, cancel: &CancellationToken) -> Result<V>;
}

type SharedFetch<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<Error>>>>;

enum Slot<V> {
    Ready(V),
    Pending { future: SharedFetch<V>, generation: u64 },
}

struct Inner<V> {
    map: HashMap<String, Slot<V>>,
    // Keys of resolved entries, least recently used first.
    order: Vec<String>,
    next_generation: u64,
}

impl<V> Inner<V> {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push(key.to_string());
    }

    fn forget(&mut self, key: &str) {
        self.map.remove(key);
        self.order.retain(|k| k != key);
    }

    fn evict_over(&mut self, capacity: usize) {
        while self.order.len() > capacity {
            let key = self.order.remove(0);
            self.map.remove(&key);
        }
    }
}

/// Coalescing LRU keyed by string.
pub struct CoalescedCache<V: Clone + Send + Sync + 'static> {
    inner: Arc<Mutex<Inner<V>>>,
    capacity: usize,
    fetcher: Arc<dyn ValueFetcher<V>>,
    // Fetches observe the owning account's token, not any single caller's,
    // so one cancelled consumer does not kill a shared fetch.
    cancel: CancellationToken,
}

impl<V: Clone + Send + Sync + 'static> CoalescedCache<V> {
    pub fn new(
        capacity: usize,
        fetcher: Arc<dyn ValueFetcher<V>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                map: HashMap::new(),
                order: Vec::new(),
                next_generation: 0,
            })),
            capacity,
            fetcher,
            cancel,
        }
    }

    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<V> {
        let future = {
            let mut inner = self.inner.lock().unwrap();
            let ready = match inner.map.get(key) {
                Some(Slot::Ready(value)) => Some(value.clone()),
                _ => None,
            };
            if let Some(value) = ready {
                inner.touch(key);
                return Ok(value);
            }
            if let Some(Slot::Pending { future, .. }) = inner.map.get(key) {
                future.clone()
            } else {
                let generation = inner.next_generation;
                inner.next_generation += 1;
                let future = self.spawn_fetch(key.to_string(), generation);
                inner.map.insert(
                    key.to_string(),
                    Slot::Pending {
                        future: future.clone(),
                        generation,
                    },
                );
                future
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = future => result,
        };
        result.map_err(|err| (*err).clone())
    }

    /// Remove the entry; an in-flight fetch keeps running for its waiters but
    /// its result is not stored.
    pub fn invalidate(&self, key: &str) {
        self.inner.lock().unwrap().forget(key);
    }

    fn spawn_fetch(&self, key: String, generation: u64) -> SharedFetch<V> {
        let fetcher = self.fetcher.clone();
        let cancel = self.cancel.clone();
        let weak: Weak<Mutex<Inner<V>>> = Arc::downgrade(&self.inner);
        let capacity = self.capacity;
        async move {
            let result = fetcher.fetch(&key, &cancel).await;
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap();
                let still_current = matches!(
                    inner.map.get(&key),
                    Some(Slot::Pending { generation: g, .. }) if *g == generation
                );
                if still_current {
                    match &result {
                        Ok(value) => {
                            inner.map.insert(key.clone(), Slot::Ready(value.clone()));
                            inner.touch(&key);
                            inner.evict_over(capacity);
                        }
                        Err(_) => inner.forget(&key),
                    }
                }
            }
            result.map_err(Arc::new)
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct CountingFetcher {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    impl CountingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: None,
                fail: false,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Some(gate),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: None,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl ValueFetcher<String> for CountingFetcher {
        async fn fetch(&self, key: &str, _cancel: &CancellationToken) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(Error::Transport("fetch failed".into()));
            }
            Ok(format!("value-{key}"))
        }
    }

    fn cache(fetcher: Arc<CountingFetcher>, capacity: usize) -> CoalescedCache<String> {
        CoalescedCache::new(capacity, fetcher, CancellationToken::new())
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_fetch() {
        let gate = Arc::new(Notify::new());
        let fetcher = CountingFetcher::gated(gate.clone());
        let cache = Arc::new(cache(fetcher.clone(), 32));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.get("vidX", &CancellationToken::new()).await
            }));
        }
        // Let every task subscribe before releasing the fetch.
        tokio::task::yield_now().await;
        gate.notify_waiters();

        for task in tasks {
            let value = task.await.expect("join").expect("get");
            assert_eq!(value, "value-vidX");
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolved_values_are_cached() {
        let fetcher = CountingFetcher::new();
        let cache = cache(fetcher.clone(), 32);
        let cancel = CancellationToken::new();

        cache.get("a", &cancel).await.expect("get");
        cache.get("a", &cancel).await.expect("get");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let fetcher = CountingFetcher::failing();
        let cache = cache(fetcher.clone(), 32);
        let cancel = CancellationToken::new();

        assert!(cache.get("a", &cancel).await.is_err());
        assert!(cache.get("a", &cancel).await.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_discards_in_flight_result() {
        let gate = Arc::new(Notify::new());
        let fetcher = CountingFetcher::gated(gate.clone());
        let cache = Arc::new(cache(fetcher.clone(), 32));

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("a", &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        cache.invalidate("a");
        gate.notify_waiters();

        // The waiter still receives the fetched value.
        assert_eq!(pending.await.expect("join").expect("get"), "value-a");

        // But the cache no longer holds it.
        let follow_up = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("a", &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        gate.notify_waiters();
        follow_up.await.expect("join").expect("get");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let fetcher = CountingFetcher::new();
        let cache = cache(fetcher.clone(), 2);
        let cancel = CancellationToken::new();

        cache.get("a", &cancel).await.expect("get");
        cache.get("b", &cancel).await.expect("get");
        cache.get("a", &cancel).await.expect("get");
        cache.get("c", &cancel).await.expect("get");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        // "b" was least recently used and fell out; "a" is still resident.
        cache.get("a", &cancel).await.expect("get");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        cache.get("b", &cancel).await.expect("get");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn caller_cancellation_does_not_kill_the_fetch() {
        let gate = Arc::new(Notify::new());
        let fetcher = CountingFetcher::gated(gate.clone());
        let cache = Arc::new(cache(fetcher.clone(), 32));

        let caller = CancellationToken::new();
        caller.cancel();
        let result = cache.get("a", &caller).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        // The shared fetch is still pending; a later caller reuses it.
        let other = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("a", &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        gate.notify_waiters();
        assert_eq!(other.await.expect("join").expect("get"), "value-a");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
