//! A bounded, expiring cache of expensive per-key values.
//!
//! Values are built on demand by a constructor function. Concurrent misses for
//! the same key are coalesced: the first caller spawns the construction and
//! every caller arriving before it completes awaits the same shared result, so
//! at most one construction per key is ever in flight.
//!
//! Entries expire a fixed TTL after their last use and are evicted in
//! least-recently-used order once the cache is full. Every evicted value is
//! handed to a release hook exactly once, outside of the cache's lock.
//!
//! Failed constructions are never cached; the next lookup retries.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;

pub use self::metrics::CacheMetrics;
use fleet_gateway_core::Cleanuper;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, future::Future, hash::Hash, num::NonZeroUsize, sync::Arc};
use tokio::time::{self, Duration, Instant};

pub struct ConnectionCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

pub struct Builder<K, V> {
    capacity: NonZeroUsize,
    ttl: Duration,
    release: Option<Release<K, V>>,
    metrics: CacheMetrics,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("construction failed: {0:#}")]
    Construct(Arc<anyhow::Error>),

    #[error("cancelled while waiting for construction")]
    Cancelled,

    #[error("construction was aborted")]
    Aborted,
}

/// Why a value left the cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Eviction {
    /// Explicitly removed, e.g. because its cluster was deleted.
    Removed,
    /// Unused for longer than the TTL.
    Expired,
    /// Least recently used when the cache was full.
    Capacity,
    /// Built by a construction that completed after its key was removed.
    Superseded,
}

type Construct<K, V> = Box<dyn Fn(K) -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;

type Release<K, V> = Box<dyn Fn(&K, V, Eviction) + Send + Sync>;

type SharedResult<V> = Shared<BoxFuture<'static, Result<V, Error>>>;

struct Inner<K, V> {
    state: Mutex<State<K, V>>,
    ttl: Duration,
    construct: Construct<K, V>,
    release: Option<Release<K, V>>,
    metrics: CacheMetrics,
}

struct State<K, V> {
    entries: LruCache<K, Entry<V>>,
    pending: HashMap<K, Pending<V>>,
    next_id: u64,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Pending<V> {
    id: u64,
    result: SharedResult<V>,
}

/// Publishes a construction's result when it completes, or withdraws its
/// pending marker if the construction task is dropped (e.g. on panic).
struct Completion<K: Eq + Hash, V> {
    inner: Arc<Inner<K, V>>,
    key: K,
    id: u64,
    done: bool,
}

enum Lookup<V> {
    Hit(V),
    Pending(SharedResult<V>),
}

// === impl ConnectionCache ===

impl<K, V> ConnectionCache<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(capacity: NonZeroUsize, ttl: Duration) -> Builder<K, V> {
        Builder {
            capacity,
            ttl,
            release: None,
            metrics: CacheMetrics::default(),
        }
    }

    /// Returns the cached value for `key`, building it if necessary.
    pub async fn get_or_create(&self, key: K) -> Result<V, Error> {
        self.get_or_create_until(key, future::pending()).await
    }

    /// Like [`ConnectionCache::get_or_create`], but stops waiting with
    /// [`Error::Cancelled`] once `cancel` completes.
    ///
    /// Cancelling a waiter never cancels the construction itself: its result is
    /// still cached and delivered to every other waiter.
    pub async fn get_or_create_until<C>(&self, key: K, cancel: C) -> Result<V, Error>
    where
        C: Future<Output = ()>,
    {
        let result = match self.lookup(key) {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Pending(result) => result,
        };

        tokio::select! {
            biased;
            res = result => res,
            () = cancel => Err(Error::Cancelled),
        }
    }

    /// Returns true if a live entry exists for `key`.
    ///
    /// Unlike a lookup, this neither extends the entry's TTL nor marks it as
    /// recently used.
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .entries
            .peek(key)
            .is_some_and(|entry| entry.expires_at > now)
    }

    /// Returns the live value cached for `key` without extending its TTL or
    /// marking it as recently used. Never starts a construction.
    pub fn peek(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .entries
            .peek(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }

    /// Evicts `key` and forgets any construction in flight for it, so that the
    /// next lookup starts a fresh construction.
    ///
    /// Returns true if a cached value was evicted.
    pub fn remove(&self, key: &K) -> bool {
        let (entry, pending) = {
            let mut state = self.inner.state.lock();
            (state.entries.pop(key), state.pending.remove(key))
        };

        if pending.is_some() {
            tracing::debug!(?key, "Forgot in-flight construction");
        }

        match entry {
            Some(Entry { value, .. }) => {
                self.inner.release(key, value, Eviction::Removed);
                true
            }
            None => false,
        }
    }

    /// Evicts every entry whose TTL has elapsed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut state = self.inner.state.lock();
            let keys = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            keys.into_iter()
                .filter_map(|key| {
                    let entry = state.entries.pop(&key)?;
                    Some((key, entry.value))
                })
                .collect::<Vec<_>>()
        };

        let evicted = expired.len();
        for (key, value) in expired {
            self.inner.release(&key, value, Eviction::Expired);
        }
        evicted
    }

    /// Periodically evicts expired entries. Never returns.
    pub async fn run_sweeper(self, period: Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let evicted = self.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted expired entries");
            }
        }
    }

    /// The number of cached entries, including expired entries that have not
    /// been swept yet.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    fn lookup(&self, key: K) -> Lookup<V> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let hit = match state.entries.get_mut(&key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.inner.ttl;
                Some(entry.value.clone())
            }
            _ => None,
        };
        if let Some(value) = hit {
            drop(state);
            self.inner.metrics.hit();
            return Lookup::Hit(value);
        }

        // Anything still present is expired.
        let expired = state.entries.pop(&key).map(|entry| entry.value);

        let result = match state.pending.get(&key) {
            Some(pending) => pending.result.clone(),
            None => self.start(&mut state, key.clone()),
        };
        drop(state);

        if let Some(value) = expired {
            self.inner.release(&key, value, Eviction::Expired);
        }
        Lookup::Pending(result)
    }

    /// Spawns a construction for `key` and records it as pending.
    ///
    /// Must be called with the state lock held; the construction task cannot
    /// publish its result before the pending marker is in place. The
    /// constructor itself is only invoked on the spawned task, never under the
    /// lock, so it may use the cache.
    fn start(&self, state: &mut State<K, V>, key: K) -> SharedResult<V> {
        let id = state.next_id;
        state.next_id += 1;

        let completion = Completion {
            inner: self.inner.clone(),
            key: key.clone(),
            id,
            done: false,
        };
        let task = tokio::spawn(async move {
            let construct = (completion.inner.construct)(completion.key.clone());
            let result = construct.await.map_err(|e| Error::Construct(Arc::new(e)));
            completion.complete(&result);
            result
        });

        let result = async move {
            match task.await {
                Ok(result) => result,
                Err(error) => {
                    tracing::error!(%error, "Construction task failed");
                    Err(Error::Aborted)
                }
            }
        }
        .boxed()
        .shared();

        state.pending.insert(
            key,
            Pending {
                id,
                result: result.clone(),
            },
        );
        result
    }
}

impl<K, V> Clone for ConnectionCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash + fmt::Debug, V> fmt::Debug for ConnectionCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

/// Cluster-keyed caches drop a cluster's entry when it is removed.
impl<V> Cleanuper for ConnectionCache<String, V>
where
    V: Clone + Send + Sync + 'static,
{
    fn on_cluster_removed(&self, cluster: &str) {
        self.remove(&cluster.to_string());
    }
}

// === impl Builder ===

impl<K, V> Builder<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Sets the hook that receives every value leaving the cache.
    pub fn on_release(mut self, release: impl Fn(&K, V, Eviction) + Send + Sync + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build<F, Fut>(self, construct: F) -> ConnectionCache<K, V>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let Self {
            capacity,
            ttl,
            release,
            metrics,
        } = self;
        ConnectionCache {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: LruCache::new(capacity),
                    pending: HashMap::new(),
                    next_id: 0,
                }),
                ttl,
                construct: Box::new(move |key| construct(key).boxed()),
                release,
                metrics,
            }),
        }
    }
}

// === impl Inner ===

impl<K: fmt::Debug, V> Inner<K, V> {
    fn release(&self, key: &K, value: V, cause: Eviction) {
        self.metrics.evicted(cause);
        tracing::debug!(?key, ?cause, "Releasing");
        match &self.release {
            Some(release) => release(key, value, cause),
            None => drop(value),
        }
    }
}

impl<K: Eq + Hash + fmt::Debug, V> fmt::Debug for Inner<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionCache")
            .field("keys", &state.entries.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("pending", &state.pending.keys().collect::<Vec<_>>())
            .field("ttl", &self.ttl)
            .finish()
    }
}

// === impl Completion ===

impl<K, V> Completion<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug,
    V: Clone,
{
    fn complete(mut self, result: &Result<V, Error>) {
        self.done = true;
        let inner = &self.inner;

        let mut released = Vec::new();
        {
            let mut state = inner.state.lock();
            let current = state.pending.get(&self.key).map(|p| p.id) == Some(self.id);
            if current {
                state.pending.remove(&self.key);
            }

            if let Ok(value) = result {
                if current {
                    inner.metrics.miss();
                    let entry = Entry {
                        value: value.clone(),
                        expires_at: Instant::now() + inner.ttl,
                    };
                    if let Some((key, old)) = state.entries.push(self.key.clone(), entry) {
                        let cause = if key == self.key {
                            Eviction::Superseded
                        } else {
                            Eviction::Capacity
                        };
                        released.push((key, old.value, cause));
                    }
                } else {
                    // The key was removed while this construction was in
                    // flight. Its waiters still receive the value, but it must
                    // not outlive them in the cache.
                    released.push((self.key.clone(), value.clone(), Eviction::Superseded));
                }
            }
        }

        for (key, value, cause) in released {
            inner.release(&key, value, cause);
        }
    }
}

impl<K, V> Drop for Completion<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.pending.get(&self.key).map(|p| p.id) == Some(self.id) {
            state.pending.remove(&self.key);
        }
    }
}
