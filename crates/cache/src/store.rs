//! Typed object cache with VM/GPU budgets and LRU eviction
//!
//! Objects are stored per cache type, then per key. Every sized object is
//! also tracked by the [`RecencyTracker`], which evicts least recently used
//! objects whenever a budget goes over its ceiling during [`ObjectCache::cleanup`].
//! Cleanup normally runs on a background timer; callers never evict for
//! budget reasons themselves.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::association::{CacheType, CachedAssociation, CachedObject};
use crate::budget::{BudgetState, BudgetStats, Dimension};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::notify::{CacheListener, ChangeFilter, ChangeKind, ChangeNotifier, ListenerRegistration};
use crate::recency::{CleanupReport, EvictionSink, RecencyTracker};
use crate::timer::CleanupTimer;

/// Requirements for cache keys
pub trait CacheKey: Eq + Hash + Clone + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + Send + Sync + 'static {}

/// Key -> association map of one cache type
type TypeMap<K> = RwLock<HashMap<K, Arc<CachedAssociation<K>>>>;

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    /// Process memory budget
    pub vm: BudgetStats,
    /// Graphics memory budget
    pub gpu: BudgetStats,
    /// Number of distinct sized objects tracked for eviction
    pub tracked_objects: usize,
    /// Number of (key, type) associations, sized or not
    pub associations: usize,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of associations evicted due to memory pressure
    pub evictions: u64,
    /// Number of cleanup passes that ran
    pub cleanup_runs: u64,
    /// Number of cleanup passes skipped because one was already running
    pub cleanup_skips: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Get the statistics of one budget
    pub fn budget(&self, dimension: Dimension) -> &BudgetStats {
        match dimension {
            Dimension::Vm => &self.vm,
            Dimension::Gpu => &self.gpu,
        }
    }
}

/// Shared state behind every [`ObjectCache`] handle
struct StoreInner<K> {
    types: RwLock<HashMap<CacheType, Arc<TypeMap<K>>>>,
    tracker: RecencyTracker<K>,
    notifier: Arc<ChangeNotifier>,
    timer: Mutex<Option<CleanupTimer>>,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: CacheKey> StoreInner<K> {
    fn type_map(&self, cache_type: CacheType) -> Option<Arc<TypeMap<K>>> {
        self.types.read().get(&cache_type).cloned()
    }

    fn type_map_or_insert(&self, cache_type: CacheType) -> Arc<TypeMap<K>> {
        if let Some(map) = self.type_map(cache_type) {
            return map;
        }
        self.types.write().entry(cache_type).or_default().clone()
    }

    /// Remove associations from a type map and from the tracker
    ///
    /// The tracker is updated while the map lock is still held, so no other
    /// thread sees one without the other.
    fn detach<F>(&self, map: &TypeMap<K>, take: F) -> Vec<Arc<CachedAssociation<K>>>
    where
        F: FnOnce(&mut HashMap<K, Arc<CachedAssociation<K>>>) -> Vec<Arc<CachedAssociation<K>>>,
    {
        let mut entries = map.write();
        let removed = take(&mut *entries);
        self.tracker.record_remove_all(&removed);
        removed
    }
}

impl<K: CacheKey> EvictionSink<K> for StoreInner<K> {
    fn evict(&self, associations: Vec<Arc<CachedAssociation<K>>>) {
        let mut by_type: HashMap<CacheType, Vec<Arc<CachedAssociation<K>>>> = HashMap::new();
        for association in associations {
            by_type
                .entry(association.cache_type())
                .or_default()
                .push(association);
        }

        for (cache_type, batch) in by_type {
            let Some(map) = self.type_map(cache_type) else {
                continue;
            };

            let mut removed = Vec::with_capacity(batch.len());
            {
                let mut entries = map.write();
                for association in &batch {
                    // A replaced or cleared binding is not ours to remove
                    let still_bound = entries
                        .get(association.key())
                        .is_some_and(|current| Arc::ptr_eq(current, association));
                    if still_bound {
                        entries.remove(association.key());
                        removed.push(association.object().clone());
                    }
                }
            }

            trace!(
                cache_type = %cache_type,
                requested = batch.len(),
                removed = removed.len(),
                "evicted cache associations"
            );
            self.evictions.fetch_add(removed.len() as u64, Ordering::Relaxed);
            self.notifier.notify(cache_type, ChangeKind::Removal, removed);
        }
    }
}

/// Thread-safe object cache keyed by `(key, cache type)`.
///
/// Cloning the cache is cheap and every clone addresses the same storage.
/// Budgets are unbounded until configured, so nothing is ever evicted
/// unless a ceiling is set.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use butterpaper_cache::{Dimension, ObjectCache};
///
/// struct Tessellation { triangles: Vec<[f32; 9]> }
///
/// let cache: ObjectCache<u64> = ObjectCache::new();
/// cache.set_ceiling(Dimension::Vm, 64 * 1024 * 1024);
///
/// let mesh = Arc::new(Tessellation { triangles: Vec::new() });
/// cache.put_typed(42, mesh, 4096, 0);
///
/// if let Some(mesh) = cache.get_typed::<Tessellation>(&42) {
///     println!("Cache hit! {} triangles", mesh.triangles.len());
/// }
///
/// // Normally driven by the cleanup timer
/// let report = cache.cleanup();
/// assert!(!report.evicted_anything());
/// ```
pub struct ObjectCache<K: CacheKey> {
    inner: Arc<StoreInner<K>>,
}

impl<K: CacheKey> ObjectCache<K> {
    /// Create a cache with unbounded budgets and no cleanup timer
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|store: &Weak<StoreInner<K>>| {
            let sink: Weak<dyn EvictionSink<K>> = store.clone();
            StoreInner {
                types: RwLock::new(HashMap::new()),
                tracker: RecencyTracker::new(sink),
                notifier: Arc::new(ChangeNotifier::new()),
                timer: Mutex::new(None),
                closed: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    /// Create a cache from a configuration
    ///
    /// Applies the budget limits and starts the cleanup timer if the
    /// configuration has a cleanup interval.
    ///
    /// # Errors
    /// Returns an error if the cleanup thread cannot be spawned.
    pub fn with_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let cache = Self::new();
        cache.configure(config);
        if let Some(interval) = config.cleanup_interval {
            cache.start_cleanup_timer(interval)?;
        }
        Ok(cache)
    }

    /// Apply the budget limits of a configuration
    ///
    /// Takes effect on the next cleanup. The cleanup timer is not touched.
    pub fn configure(&self, config: &CacheConfig) {
        for dimension in Dimension::ALL {
            let limits = config.limits(dimension);
            let budget = self.budget(dimension);
            budget.set_unbounded();
            if let Some(ceiling) = limits.ceiling {
                budget.set_ceiling(ceiling);
            }
            if let Some(low_water) = limits.low_water {
                budget.set_low_water(low_water);
            }
        }
        debug!(?config, "object cache configured");
    }

    /// Store an object under `(key, cache_type)`
    ///
    /// Replaces any previous binding of the key and returns the object it
    /// held. Listeners get a removal event for the replaced object followed
    /// by an insertion event for the new one. Storing the same object
    /// instance with the same sizes again only refreshes its recency.
    ///
    /// # Arguments
    ///
    /// * `key` - Key, unique within `cache_type`
    /// * `object` - Object to cache
    /// * `cache_type` - Association type
    /// * `size_vm` - Process memory used by the object in bytes
    /// * `size_gpu` - Graphics memory used by the object in bytes
    pub fn put(
        &self,
        key: K,
        object: CachedObject,
        cache_type: CacheType,
        size_vm: u64,
        size_gpu: u64,
    ) -> Option<CachedObject> {
        let map = self.inner.type_map_or_insert(cache_type);

        let (association, previous) = {
            let mut entries = map.write();
            let unchanged = entries
                .get(&key)
                .filter(|existing| existing.same_binding(&object, size_vm, size_gpu))
                .cloned();
            if let Some(existing) = unchanged {
                drop(entries);
                self.inner.tracker.record_use(existing.object_id());
                return Some(existing.object().clone());
            }

            let association = Arc::new(CachedAssociation::new(
                key.clone(),
                cache_type,
                object,
                size_vm,
                size_gpu,
            ));
            let previous = entries.insert(key, association.clone());
            self.inner.tracker.record_add(&association);
            if let Some(previous) = &previous {
                self.inner.tracker.record_remove(previous);
            }
            (association, previous)
        };

        trace!(
            cache_type = %cache_type,
            size_vm,
            size_gpu,
            replaced = previous.is_some(),
            "cached object"
        );

        let notifier = &self.inner.notifier;
        if let Some(previous) = &previous {
            notifier.notify(cache_type, ChangeKind::Removal, vec![previous.object().clone()]);
        }
        notifier.notify(cache_type, ChangeKind::Insertion, vec![association.object().clone()]);

        previous.map(|previous| previous.object().clone())
    }

    /// Retrieve the object stored under `(key, cache_type)`
    ///
    /// A hit marks the object as most recently used.
    pub fn get(&self, key: &K, cache_type: CacheType) -> Option<CachedObject> {
        let found = self
            .inner
            .type_map(cache_type)
            .and_then(|map| map.read().get(key).cloned());

        match found {
            Some(association) => {
                self.inner.tracker.record_use(association.object_id());
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(association.object().clone())
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Check if a binding exists without updating LRU tracking
    pub fn contains(&self, key: &K, cache_type: CacheType) -> bool {
        self.inner
            .type_map(cache_type)
            .is_some_and(|map| map.read().contains_key(key))
    }

    /// Remove the binding of `(key, cache_type)`
    ///
    /// # Returns
    ///
    /// The object that was bound, or `None` if there was no binding
    pub fn clear(&self, key: &K, cache_type: CacheType) -> Option<CachedObject> {
        let map = self.inner.type_map(cache_type)?;
        let removed = self
            .inner
            .detach(&map, |entries| entries.remove(key).into_iter().collect());
        let object = removed.first().map(|association| association.object().clone());
        self.release(cache_type, removed, None);
        object
    }

    /// Remove every binding of a cache type
    ///
    /// Listeners get a single removal event. Returns the number of bindings
    /// removed.
    pub fn clear_all(&self, cache_type: CacheType) -> usize {
        self.clear_all_with(cache_type, None)
    }

    /// Remove every binding of a cache type, appending the removed objects
    /// to `collector`
    pub fn clear_all_into(&self, cache_type: CacheType, collector: &mut Vec<CachedObject>) -> usize {
        self.clear_all_with(cache_type, Some(collector))
    }

    fn clear_all_with(&self, cache_type: CacheType, collector: Option<&mut Vec<CachedObject>>) -> usize {
        let Some(map) = self.inner.type_map(cache_type) else {
            return 0;
        };
        let removed = self
            .inner
            .detach(&map, |entries| entries.drain().map(|(_, a)| a).collect());
        self.release(cache_type, removed, collector)
    }

    /// Remove the bindings of some keys of a cache type
    ///
    /// Listeners get a single removal event. Returns the number of bindings
    /// removed.
    pub fn clear_keys<'a, I>(&self, keys: I, cache_type: CacheType) -> usize
    where
        I: IntoIterator<Item = &'a K>,
    {
        self.clear_keys_with(keys, cache_type, None)
    }

    /// Remove the bindings of some keys, appending the removed objects to
    /// `collector`
    pub fn clear_keys_into<'a, I>(
        &self,
        keys: I,
        cache_type: CacheType,
        collector: &mut Vec<CachedObject>,
    ) -> usize
    where
        I: IntoIterator<Item = &'a K>,
    {
        self.clear_keys_with(keys, cache_type, Some(collector))
    }

    fn clear_keys_with<'a, I>(
        &self,
        keys: I,
        cache_type: CacheType,
        collector: Option<&mut Vec<CachedObject>>,
    ) -> usize
    where
        I: IntoIterator<Item = &'a K>,
    {
        let Some(map) = self.inner.type_map(cache_type) else {
            return 0;
        };
        let removed = self.inner.detach(&map, |entries| {
            keys.into_iter().filter_map(|key| entries.remove(key)).collect()
        });
        self.release(cache_type, removed, collector)
    }

    /// Hand removed associations to the collector and the listeners
    fn release(
        &self,
        cache_type: CacheType,
        removed: Vec<Arc<CachedAssociation<K>>>,
        collector: Option<&mut Vec<CachedObject>>,
    ) -> usize {
        let count = removed.len();
        if count == 0 {
            return 0;
        }

        let objects: Vec<CachedObject> = removed.iter().map(|a| a.object().clone()).collect();
        if let Some(collector) = collector {
            collector.extend(objects.iter().cloned());
        }
        trace!(cache_type = %cache_type, count, "cleared cache associations");
        self.inner.notifier.notify(cache_type, ChangeKind::Removal, objects);
        count
    }

    /// Get every distinct object of a cache type
    ///
    /// Each returned object is marked as used.
    pub fn get_all(&self, cache_type: CacheType) -> Vec<CachedObject> {
        let Some(map) = self.inner.type_map(cache_type) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let objects: Vec<CachedObject> = map
            .read()
            .values()
            .filter(|association| seen.insert(association.object_id()))
            .map(|association| association.object().clone())
            .collect();

        self.inner.tracker.record_use_all(seen);
        objects
    }

    /// Get every `(key, object)` binding of a cache type
    ///
    /// Each returned object is marked as used.
    pub fn get_all_entries(&self, cache_type: CacheType) -> Vec<(K, CachedObject)> {
        let Some(map) = self.inner.type_map(cache_type) else {
            return Vec::new();
        };

        let mut used = HashSet::new();
        let entries: Vec<(K, CachedObject)> = map
            .read()
            .values()
            .map(|association| {
                used.insert(association.object_id());
                (association.key().clone(), association.object().clone())
            })
            .collect();

        self.inner.tracker.record_use_all(used);
        entries
    }

    /// Store a typed object under its own type
    ///
    /// Returns the previous object if it had the same type.
    pub fn put_typed<T>(&self, key: K, object: Arc<T>, size_vm: u64, size_gpu: u64) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.put(key, object, CacheType::of::<T>(), size_vm, size_gpu)
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    /// Retrieve an object stored with [`ObjectCache::put_typed`]
    pub fn get_typed<T>(&self, key: &K) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get(key, CacheType::of::<T>())?.downcast::<T>().ok()
    }

    /// Remove an object stored with [`ObjectCache::put_typed`]
    pub fn clear_typed<T>(&self, key: &K) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.clear(key, CacheType::of::<T>())?.downcast::<T>().ok()
    }

    /// Subscribe a listener to changes of `cache_type`
    ///
    /// The cache keeps only a weak reference to the listener. The
    /// registration ends when the returned guard is dropped (unless it was
    /// detached), when the listener is dropped, or on
    /// [`ObjectCache::deregister_listener`].
    pub fn register_listener<L>(
        &self,
        listener: &Arc<L>,
        filter: ChangeFilter,
        cache_type: CacheType,
    ) -> ListenerRegistration
    where
        L: CacheListener + 'static,
    {
        self.inner.notifier.subscribe(listener, filter, cache_type)
    }

    /// Remove all registrations of `listener` for `cache_type`
    pub fn deregister_listener<L>(&self, listener: &Arc<L>, cache_type: CacheType) -> usize
    where
        L: CacheListener + 'static,
    {
        self.inner.notifier.deregister_listener(listener, cache_type)
    }

    /// Get the budget of a dimension
    pub fn budget(&self, dimension: Dimension) -> &BudgetState {
        self.inner.tracker.budget(dimension)
    }

    /// Set the usage that triggers cleanup, in bytes
    pub fn set_ceiling(&self, dimension: Dimension, bytes: u64) {
        self.budget(dimension).set_ceiling(bytes);
    }

    /// Set the usage cleanup tries to reach, in bytes
    pub fn set_low_water(&self, dimension: Dimension, bytes: u64) {
        self.budget(dimension).set_low_water(bytes);
    }

    /// Run one eviction pass now
    ///
    /// This is what the cleanup timer calls. A call that overlaps another
    /// pass does nothing and reports itself as skipped.
    pub fn cleanup(&self) -> CleanupReport {
        let report = self.inner.tracker.cleanup();
        if report.evicted_anything() {
            debug!(
                objects = report.evicted_objects,
                freed_vm = report.freed_vm,
                freed_gpu = report.freed_gpu,
                "cache cleanup finished"
            );
        }
        report
    }

    /// Run [`ObjectCache::cleanup`] every `interval` on a background thread
    ///
    /// Replaces a running timer. The thread only holds a weak reference to
    /// the cache and ends once every handle is dropped.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn start_cleanup_timer(&self, interval: Duration) -> Result<(), CacheError> {
        self.stop_cleanup_timer();

        let store = Arc::downgrade(&self.inner);
        let timer = CleanupTimer::spawn(interval, move || match store.upgrade() {
            Some(inner) => {
                inner.tracker.cleanup();
                true
            }
            None => false,
        })
        .map_err(CacheError::TimerSpawn)?;

        let replaced = self.inner.timer.lock().replace(timer);
        if let Some(replaced) = replaced {
            replaced.stop();
        }
        Ok(())
    }

    /// Stop the cleanup timer, if one is running
    pub fn stop_cleanup_timer(&self) {
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            timer.stop();
        }
    }

    /// Returns true if a cleanup timer is running
    pub fn has_cleanup_timer(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .is_some_and(|timer| timer.is_running())
    }

    /// Stop the cleanup timer and drop every binding without notifying
    /// listeners
    ///
    /// Safe to call repeatedly and while a cleanup pass is running. The
    /// cache stays usable afterwards, without a timer.
    pub fn close(&self) {
        self.stop_cleanup_timer();

        let maps: Vec<Arc<TypeMap<K>>> = self.inner.types.read().values().cloned().collect();
        let released: usize = maps
            .iter()
            .map(|map| {
                self.inner
                    .detach(map, |entries| entries.drain().map(|(_, a)| a).collect())
                    .len()
            })
            .sum();

        if !self.inner.closed.swap(true, Ordering::AcqRel) || released > 0 {
            info!(released, "object cache closed");
        }
    }

    /// Number of bindings across all cache types
    pub fn len(&self) -> usize {
        self.inner
            .types
            .read()
            .values()
            .map(|map| map.read().len())
            .sum()
    }

    /// Number of bindings of one cache type
    pub fn type_len(&self, cache_type: CacheType) -> usize {
        self.inner
            .type_map(cache_type)
            .map_or(0, |map| map.read().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        let tracker = &self.inner.tracker;
        CacheStats {
            vm: tracker.budget(Dimension::Vm).stats(),
            gpu: tracker.budget(Dimension::Gpu).stats(),
            tracked_objects: tracker.tracked_objects(),
            associations: self.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            cleanup_runs: tracker.cleanup_runs(),
            cleanup_skips: tracker.cleanup_skips(),
        }
    }
}

impl<K: CacheKey> Clone for ObjectCache<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey> Default for ObjectCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey> fmt::Debug for ObjectCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("associations", &self.len())
            .field("tracked_objects", &self.inner.tracker.tracked_objects())
            .finish()
    }
}
