//! Response Cache
//!
//! Short-TTL key/value cache in front of REST provider calls.
//!
//! - Expiry is checked on read only; expired entries stay resident until
//!   LRU eviction reclaims them, so they can be served stale on error.
//! - Concurrent misses for the same key share a single upstream fetch.
//!   The fetch runs in its own task, so a cancelled caller does not cancel
//!   the fetch for the others.
//! - Serving stale data on fetch failure is a per-instance setting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::MarketDataError;
use crate::infrastructure::metrics::{self, CacheOutcome};

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup<V> {
    /// The value.
    pub value: V,
    /// `false` only for the caller whose request triggered the fetch.
    pub served_from_cache: bool,
    /// The value outlived its TTL and was served because a refetch failed.
    pub stale: bool,
}

type InflightFetch<V> = Shared<BoxFuture<'static, Result<V, MarketDataError>>>;

struct Entry<V> {
    value: V,
    fetched_at: Instant,
    last_access: u64,
}

impl<V> Entry<V> {
    /// Freshness is judged against the reader's `ttl`, not the writer's.
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.fetched_at) < ttl
    }
}

struct CacheState<V> {
    entries: HashMap<String, Entry<V>>,
    inflight: HashMap<String, InflightFetch<V>>,
    tick: u64,
}

impl<V> CacheState<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn insert(&mut self, key: String, value: V, capacity: usize) {
        let last_access = self.next_tick();
        self.entries.insert(
            key,
            Entry {
                value,
                fetched_at: Instant::now(),
                last_access,
            },
        );
        while self.entries.len() > capacity {
            let Some(lru) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.entries.remove(&lru);
        }
    }
}

/// Shared, coalescing response cache.
pub struct ResponseCache<V> {
    name: &'static str,
    capacity: usize,
    serve_stale_on_error: bool,
    state: Arc<Mutex<CacheState<V>>>,
}

impl<V> std::fmt::Debug for ResponseCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("serve_stale_on_error", &self.serve_stale_on_error)
            .finish_non_exhaustive()
    }
}

impl<V> ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` entries.
    ///
    /// `name` labels the cache's metrics.
    #[must_use]
    pub fn new(name: &'static str, capacity: usize, serve_stale_on_error: bool) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            serve_stale_on_error,
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                tick: 0,
            })),
        }
    }

    /// Return the cached value for `key` if younger than this call's `ttl`, otherwise
    /// fetch it, sharing any fetch already in flight for the same key.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, unless stale serving is enabled and an
    /// expired entry exists.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<CacheLookup<V>, MarketDataError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, MarketDataError>> + Send + 'static,
    {
        let (inflight, leader) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let tick = state.next_tick();

            if let Some(entry) = state.entries.get_mut(key)
                && entry.is_fresh(now, ttl)
            {
                entry.last_access = tick;
                metrics::record_cache_outcome(self.name, CacheOutcome::Hit);
                return Ok(CacheLookup {
                    value: entry.value.clone(),
                    served_from_cache: true,
                    stale: false,
                });
            }

            if let Some(inflight) = state.inflight.get(key) {
                (inflight.clone(), false)
            } else {
                let inflight = self.start_fetch(key.to_string(), fetch());
                state.inflight.insert(key.to_string(), inflight.clone());
                (inflight, true)
            }
        };

        match inflight.await {
            Ok(value) => {
                let outcome = if leader {
                    CacheOutcome::Miss
                } else {
                    CacheOutcome::Coalesced
                };
                metrics::record_cache_outcome(self.name, outcome);
                Ok(CacheLookup {
                    value,
                    served_from_cache: !leader,
                    stale: false,
                })
            }
            Err(e) => {
                if self.serve_stale_on_error
                    && let Some(value) = self.resident(key)
                {
                    metrics::record_cache_outcome(self.name, CacheOutcome::Stale);
                    tracing::warn!(
                        cache = self.name,
                        key = %key,
                        error = %e,
                        "Fetch failed, serving stale entry"
                    );
                    return Ok(CacheLookup {
                        value,
                        served_from_cache: true,
                        stale: true,
                    });
                }
                Err(e)
            }
        }
    }

    fn start_fetch<Fut>(&self, key: String, fetch: Fut) -> InflightFetch<V>
    where
        Fut: Future<Output = Result<V, MarketDataError>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let capacity = self.capacity;
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = fetch.await;
            let mut state = state.lock();
            state.inflight.remove(&task_key);
            if let Ok(value) = &result {
                state.insert(task_key, value.clone(), capacity);
            }
            result
        });

        let state = Arc::clone(&self.state);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    state.lock().inflight.remove(&key);
                    Err(MarketDataError::Internal(format!("cache fetch task failed: {e}")))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn resident(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        let tick = state.next_tick();
        state.entries.get_mut(key).map(|entry| {
            entry.last_access = tick;
            entry.value.clone()
        })
    }

    /// Drop an entry.
    pub fn invalidate(&self, key: &str) {
        self.state.lock().entries.remove(key);
    }

    /// Resident entries, fresh or expired.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no entries are resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
