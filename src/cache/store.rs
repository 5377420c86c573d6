//! Multi-index entity cache.
//!
//! One LRU of values, addressable through every lookup the entity type
//! declares. Misses are single-flight per key: concurrent callers for the
//! same key share one load. A write or invalidation reached through any
//! lookup removes the value from all of them.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use metrics::counter;
use tracing::{debug, trace};

use crate::application::repos::RepoError;

use super::keys::{Cacheable, IndexKey, Lookup};
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::store";

const METRIC_HIT: &str = "fedcache_cache_hit_total";
const METRIC_MISS: &str = "fedcache_cache_miss_total";
const METRIC_EVICT: &str = "fedcache_cache_evict_total";
const METRIC_COALESCED: &str = "fedcache_cache_coalesced_total";

type SharedLoad<T> = Shared<BoxFuture<'static, Result<T, RepoError>>>;

/// Called with every value removed by invalidation or replaced by a write.
pub type InvalidateHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T: Cacheable> {
    value: T,
    keys: Vec<IndexKey<T::Lookup>>,
}

struct Inflight<T> {
    generation: u64,
    epoch: u64,
    load: SharedLoad<T>,
}

struct Inner<T: Cacheable> {
    entries: LruCache<u64, Entry<T>>,
    index: HashMap<IndexKey<T::Lookup>, Vec<u64>>,
    negative: LruCache<IndexKey<T::Lookup>, Instant>,
    inflight: HashMap<IndexKey<T::Lookup>, Inflight<T>>,
    next_slot: u64,
    next_generation: u64,
    // Bumped by every write, invalidation and clear.
    epoch: u64,
    // Epoch at which each key was last written or invalidated. A load that
    // started before one of its keys was touched hands its result to
    // waiters but does not cache it.
    touched: HashMap<IndexKey<T::Lookup>, u64>,
    // Loads that started before this epoch are stale regardless of keys.
    floor: u64,
    touched_limit: usize,
}

impl<T: Cacheable> Inner<T> {
    /// Record a write or invalidation of `keys`.
    fn touch<'a, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'a IndexKey<T::Lookup>>,
    {
        self.epoch = self.epoch.wrapping_add(1);
        for key in keys {
            self.touched.insert(key.clone(), self.epoch);
        }
        if self.touched.len() > self.touched_limit {
            self.touched.clear();
            self.floor = self.epoch;
        }
    }

    /// Whether anything under `keys` changed after a load started at `since`.
    fn is_stale<'a, I>(&self, since: u64, keys: I) -> bool
    where
        I: IntoIterator<Item = &'a IndexKey<T::Lookup>>,
    {
        since < self.floor
            || keys
                .into_iter()
                .any(|key| self.touched.get(key).is_some_and(|at| *at > since))
    }

    fn lookup(&mut self, key: &IndexKey<T::Lookup>) -> Option<T> {
        let slot = *self.index.get(key)?.first()?;
        self.entries.get(&slot).map(|entry| entry.value.clone())
    }

    fn negative_hit(&mut self, key: &IndexKey<T::Lookup>, ttl: Option<Duration>) -> bool {
        let Some(ttl) = ttl else {
            return false;
        };
        match self.negative.get(key) {
            Some(at) if at.elapsed() < ttl => true,
            Some(_) => {
                self.negative.pop(key);
                false
            }
            None => false,
        }
    }

    fn unindex(&mut self, slot: u64, keys: &[IndexKey<T::Lookup>]) {
        for key in keys {
            if let Some(slots) = self.index.get_mut(key) {
                slots.retain(|existing| *existing != slot);
                if slots.is_empty() {
                    self.index.remove(key);
                }
            }
        }
    }

    fn remove_slot(&mut self, slot: u64) -> Option<T> {
        let entry = self.entries.pop(&slot)?;
        self.unindex(slot, &entry.keys);
        Some(entry.value)
    }

    /// Insert `value`, displacing any entry that collides on a unique key.
    /// Returns the displaced values.
    fn insert(&mut self, mut value: T) -> Vec<T> {
        value.strip_populated();
        let keys = value.index_keys();

        let mut stale: Vec<u64> = keys
            .iter()
            .filter(|key| key.lookup().is_unique())
            .filter_map(|key| self.index.get(key))
            .flat_map(|slots| slots.iter().copied())
            .collect();
        stale.sort_unstable();
        stale.dedup();

        let displaced: Vec<T> = stale
            .into_iter()
            .filter_map(|slot| self.remove_slot(slot))
            .collect();

        let slot = self.next_slot;
        self.next_slot = self.next_slot.wrapping_add(1);
        for key in &keys {
            self.index.entry(key.clone()).or_default().push(slot);
            self.negative.pop(key);
        }

        if let Some((evicted_slot, evicted)) = self.entries.push(slot, Entry { value, keys }) {
            if evicted_slot != slot {
                self.unindex(evicted_slot, &evicted.keys);
                counter!(METRIC_EVICT, "cache" => T::NAME).increment(1);
            }
        }

        displaced
    }

    fn remove_by_key(&mut self, key: &IndexKey<T::Lookup>) -> Vec<T> {
        let slots = self.index.get(key).cloned().unwrap_or_default();
        slots
            .into_iter()
            .filter_map(|slot| self.remove_slot(slot))
            .collect()
    }
}

enum Probe<T> {
    Hit(T),
    Absent,
    Wait {
        generation: u64,
        epoch: u64,
        load: SharedLoad<T>,
    },
}

/// Bounded LRU cache of `T` indexed by every lookup of `T::Lookup`.
pub struct MultiIndexCache<T: Cacheable> {
    capacity: usize,
    negative_ttl: Option<Duration>,
    inner: Mutex<Inner<T>>,
    hook: RwLock<Option<InvalidateHook<T>>>,
}

impl<T: Cacheable> MultiIndexCache<T> {
    /// A capacity of zero disables caching; every call goes to the loader.
    pub fn new(capacity: usize, negative_ttl: Option<Duration>) -> Self {
        let bound = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            negative_ttl,
            inner: Mutex::new(Inner {
                entries: LruCache::new(bound),
                index: HashMap::new(),
                negative: LruCache::new(bound),
                inflight: HashMap::new(),
                next_slot: 0,
                next_generation: 0,
                epoch: 0,
                touched: HashMap::new(),
                floor: 0,
                touched_limit: capacity.max(64).saturating_mul(4),
            }),
            hook: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        T::NAME
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Register the fan-out callback run for invalidated and written values.
    pub fn set_invalidate_hook<F>(&self, hook: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        *rw_write(&self.hook, SOURCE, "set_invalidate_hook") = Some(Arc::new(hook));
    }

    fn run_hook(&self, values: &[T]) {
        if values.is_empty() {
            return;
        }
        let hook = rw_read(&self.hook, SOURCE, "run_hook").clone();
        if let Some(hook) = hook {
            for value in values {
                hook(value);
            }
        }
    }

    /// Cached value under `key`, without touching the loader.
    pub fn get(&self, key: &IndexKey<T::Lookup>) -> Option<T> {
        mutex_lock(&self.inner, SOURCE, "get").lookup(key)
    }

    /// Return the value under `key`, loading it through `miss` on a cache miss.
    ///
    /// Concurrent calls for the same key while a load is in flight share that
    /// load. Dropping one caller does not cancel the load for the others.
    /// `NotFound` results are remembered for the negative TTL; other errors
    /// are returned and never cached. `miss` is invoked while the cache is
    /// locked and must only build the future, not touch this cache.
    pub async fn load_one<F, Fut>(&self, key: IndexKey<T::Lookup>, miss: F) -> Result<T, RepoError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RepoError>> + Send + 'static,
    {
        if !key.lookup().is_unique() {
            return Err(RepoError::InvalidInput {
                message: format!("lookup `{}` is not unique", key.lookup().name()),
            });
        }

        if !self.enabled() {
            counter!(METRIC_MISS, "cache" => T::NAME).increment(1);
            return miss().await;
        }

        let probe = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "load_one.probe");
            if let Some(value) = inner.lookup(&key) {
                Probe::Hit(value)
            } else if inner.negative_hit(&key, self.negative_ttl) {
                Probe::Absent
            } else if let Some(inflight) = inner.inflight.get(&key) {
                counter!(METRIC_COALESCED, "cache" => T::NAME).increment(1);
                Probe::Wait {
                    generation: inflight.generation,
                    epoch: inflight.epoch,
                    load: inflight.load.clone(),
                }
            } else {
                counter!(METRIC_MISS, "cache" => T::NAME).increment(1);
                let generation = inner.next_generation;
                inner.next_generation = inner.next_generation.wrapping_add(1);
                let epoch = inner.epoch;
                let load = miss().boxed().shared();
                inner.inflight.insert(
                    key.clone(),
                    Inflight {
                        generation,
                        epoch,
                        load: load.clone(),
                    },
                );
                Probe::Wait {
                    generation,
                    epoch,
                    load,
                }
            }
        };

        match probe {
            Probe::Hit(value) => {
                counter!(METRIC_HIT, "cache" => T::NAME).increment(1);
                trace!(cache = T::NAME, key = %key, "cache hit");
                Ok(value)
            }
            Probe::Absent => {
                counter!(METRIC_HIT, "cache" => T::NAME).increment(1);
                trace!(cache = T::NAME, key = %key, "negative cache hit");
                Err(RepoError::NotFound)
            }
            Probe::Wait {
                generation,
                epoch,
                load,
            } => {
                let result = load.await;
                self.complete(&key, generation, epoch, &result);
                result
            }
        }
    }

    fn complete(
        &self,
        key: &IndexKey<T::Lookup>,
        generation: u64,
        epoch: u64,
        result: &Result<T, RepoError>,
    ) {
        let mut inner = mutex_lock(&self.inner, SOURCE, "load_one.complete");
        let owns_slot = inner
            .inflight
            .get(key)
            .is_some_and(|inflight| inflight.generation == generation);
        if !owns_slot {
            return;
        }
        inner.inflight.remove(key);

        let stale = match result {
            Ok(value) => inner.is_stale(epoch, value.index_keys().iter().chain([key])),
            Err(_) => inner.is_stale(epoch, [key]),
        };
        if stale {
            debug!(cache = T::NAME, key = %key, "discarding load result overtaken by a write");
            return;
        }

        match result {
            Ok(value) => {
                // Displaced entries are older copies of the same rows; derived
                // state was already invalidated when those rows changed.
                let _ = inner.insert(value.clone());
            }
            Err(RepoError::NotFound) if self.negative_ttl.is_some() => {
                inner.negative.put(key.clone(), Instant::now());
            }
            Err(_) => {}
        }
    }

    /// Return every value under `keys`, loading the uncached ones with a
    /// single call to `miss`.
    ///
    /// Results are in no particular order; `miss` is not called when every
    /// key is cached.
    pub async fn load<F, Fut>(
        &self,
        keys: Vec<IndexKey<T::Lookup>>,
        miss: F,
    ) -> Result<Vec<T>, RepoError>
    where
        F: FnOnce(Vec<IndexKey<T::Lookup>>) -> Fut,
        Fut: Future<Output = Result<Vec<T>, RepoError>>,
    {
        let (mut found, uncached, epoch) = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "load.check");
            let mut found = Vec::with_capacity(keys.len());
            let mut uncached = Vec::new();
            for key in keys {
                match inner.lookup(&key) {
                    Some(value) => found.push(value),
                    None => uncached.push(key),
                }
            }
            (found, uncached, inner.epoch)
        };

        counter!(METRIC_HIT, "cache" => T::NAME).increment(found.len() as u64);
        if uncached.is_empty() {
            return Ok(found);
        }
        counter!(METRIC_MISS, "cache" => T::NAME).increment(uncached.len() as u64);

        let loaded = miss(uncached).await?;

        if self.enabled() {
            let mut inner = mutex_lock(&self.inner, SOURCE, "load.insert");
            for value in &loaded {
                if !inner.is_stale(epoch, &value.index_keys()) {
                    let _ = inner.insert(value.clone());
                }
            }
        }

        found.extend(loaded);
        Ok(found)
    }

    /// Persist `value` through `persist`, then cache it and run the
    /// invalidation hook for it. Nothing is cached when `persist` fails.
    pub async fn store<F, Fut>(&self, value: T, persist: F) -> Result<(), RepoError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), RepoError>>,
    {
        persist().await?;

        let displaced = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "store");
            inner.touch(&value.index_keys());
            if self.enabled() {
                let displaced = inner.insert(value.clone());
                for old in &displaced {
                    inner.touch(&old.index_keys());
                }
                displaced
            } else {
                Vec::new()
            }
        };

        self.run_hook(&displaced);
        self.run_hook(std::slice::from_ref(&value));
        Ok(())
    }

    /// Remove every value reachable under `key` from all lookups and run the
    /// invalidation hook for each removed value.
    pub fn invalidate(&self, key: &IndexKey<T::Lookup>) {
        let removed = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "invalidate");
            inner.touch([key]);
            inner.negative.pop(key);
            let removed = inner.remove_by_key(key);
            for value in &removed {
                inner.touch(&value.index_keys());
            }
            removed
        };

        if !removed.is_empty() {
            debug!(cache = T::NAME, key = %key, removed = removed.len(), "invalidated");
        }
        self.run_hook(&removed);
    }

    /// Drop every cached value, negative entry and pending load registration.
    pub fn clear(&self) {
        let mut inner = mutex_lock(&self.inner, SOURCE, "clear");
        inner.epoch = inner.epoch.wrapping_add(1);
        inner.floor = inner.epoch;
        inner.touched.clear();
        inner.entries.clear();
        inner.index.clear();
        inner.negative.clear();
        inner.inflight.clear();
    }
}
