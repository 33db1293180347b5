//! Recency tracking and budget-driven eviction
//!
//! The tracker keeps one recency entry per cached *object* (by identity),
//! ordered from least to most recently used, and maintains the VM and GPU
//! usage counters. An object indexed under several keys or types counts once,
//! at the largest size any of its associations declares.
//!
//! When a budget goes over its ceiling, [`RecencyTracker::cleanup`] picks a
//! batch of least recently used objects, forgets them, and hands their
//! associations to the [`EvictionSink`] (the store) for removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::association::{CachedAssociation, ObjectId};
use crate::budget::{BudgetState, Dimension};

/// Receiver of eviction decisions.
///
/// Implemented by the store. The tracker calls it without holding its own
/// lock, after the evicted objects have already been removed from the
/// recency order and the budgets, so implementations must not call back into
/// the tracker for these associations.
pub trait EvictionSink<K>: Send + Sync {
    /// Drop `associations` from wherever they are stored.
    ///
    /// An association that was replaced or cleared in the meantime must be
    /// left alone.
    fn evict(&self, associations: Vec<Arc<CachedAssociation<K>>>);
}

/// All sized associations of one object
struct RecencyEntry<K> {
    members: Vec<Arc<CachedAssociation<K>>>,
    max_vm: u64,
    max_gpu: u64,
}

/// What removing members did to an entry
enum Detached {
    /// None of the associations belonged to the entry
    NotMember,
    /// The last member is gone; the entry must be dropped
    Emptied,
    /// Members remain; the maxima shrank by these amounts
    Shrunk { vm: u64, gpu: u64 },
}

impl<K> RecencyEntry<K> {
    fn new(association: Arc<CachedAssociation<K>>) -> Self {
        Self {
            max_vm: association.size_vm(),
            max_gpu: association.size_gpu(),
            members: vec![association],
        }
    }

    fn max_size(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Vm => self.max_vm,
            Dimension::Gpu => self.max_gpu,
        }
    }

    /// Add a member, returning how much each maximum grew
    fn absorb(&mut self, association: Arc<CachedAssociation<K>>) -> (u64, u64) {
        if self.members.iter().any(|m| Arc::ptr_eq(m, &association)) {
            return (0, 0);
        }

        let grow_vm = association.size_vm().saturating_sub(self.max_vm);
        let grow_gpu = association.size_gpu().saturating_sub(self.max_gpu);
        self.max_vm += grow_vm;
        self.max_gpu += grow_gpu;
        self.members.push(association);
        (grow_vm, grow_gpu)
    }

    fn detach(&mut self, associations: &[&Arc<CachedAssociation<K>>]) -> Detached {
        let before = self.members.len();
        // Upper bound of the removed sizes; if it stays below the maximum,
        // the maximum is still held by a remaining member.
        let mut bound_vm = 0;
        let mut bound_gpu = 0;

        self.members.retain(|member| {
            let removed = associations.iter().any(|a| Arc::ptr_eq(a, member));
            if removed {
                bound_vm = bound_vm.max(member.size_vm());
                bound_gpu = bound_gpu.max(member.size_gpu());
            }
            !removed
        });

        if self.members.len() == before {
            return Detached::NotMember;
        }
        if self.members.is_empty() {
            return Detached::Emptied;
        }

        let (old_vm, old_gpu) = (self.max_vm, self.max_gpu);
        if bound_vm >= self.max_vm {
            self.max_vm = self.members.iter().map(|m| m.size_vm()).max().unwrap_or(0);
        }
        if bound_gpu >= self.max_gpu {
            self.max_gpu = self.members.iter().map(|m| m.size_gpu()).max().unwrap_or(0);
        }

        Detached::Shrunk {
            vm: old_vm - self.max_vm,
            gpu: old_gpu - self.max_gpu,
        }
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Another cleanup was already running and this one did nothing
    pub skipped: bool,
    /// Number of objects evicted
    pub evicted_objects: usize,
    /// Number of store associations handed over for removal
    pub evicted_associations: usize,
    /// Process memory released, in bytes
    pub freed_vm: u64,
    /// Graphics memory released, in bytes
    pub freed_gpu: u64,
}

impl CleanupReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn evicted_anything(&self) -> bool {
        self.evicted_objects > 0
    }
}

/// Resets the cleanup flag when a pass ends, even by unwinding
struct CleanupGuard<'a>(&'a AtomicBool);

impl<'a> CleanupGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// LRU bookkeeping and eviction for cached objects.
///
/// All mutations of the recency order and of the budget counters happen
/// under one lock, which is never held while calling the [`EvictionSink`].
pub struct RecencyTracker<K> {
    /// Iteration order of the `LruCache` is most recent first
    order: Mutex<LruCache<ObjectId, RecencyEntry<K>>>,
    vm: BudgetState,
    gpu: BudgetState,
    cleaning: AtomicBool,
    sink: Weak<dyn EvictionSink<K>>,
    cleanup_runs: AtomicU64,
    cleanup_skips: AtomicU64,
}

impl<K> RecencyTracker<K> {
    /// Create a tracker with unbounded budgets
    ///
    /// # Arguments
    ///
    /// * `sink` - Receiver of evicted associations. Held weakly; once it is
    ///   gone, cleanup still updates the tracker but has nobody to notify.
    pub fn new(sink: Weak<dyn EvictionSink<K>>) -> Self {
        Self {
            order: Mutex::new(LruCache::unbounded()),
            vm: BudgetState::new(Dimension::Vm),
            gpu: BudgetState::new(Dimension::Gpu),
            cleaning: AtomicBool::new(false),
            sink,
            cleanup_runs: AtomicU64::new(0),
            cleanup_skips: AtomicU64::new(0),
        }
    }

    /// Get the budget of a dimension
    pub fn budget(&self, dimension: Dimension) -> &BudgetState {
        match dimension {
            Dimension::Vm => &self.vm,
            Dimension::Gpu => &self.gpu,
        }
    }

    /// Number of distinct objects currently tracked
    pub fn tracked_objects(&self) -> usize {
        self.order.lock().len()
    }

    /// Returns true if the object is tracked, without touching its recency
    pub fn is_tracked(&self, object: ObjectId) -> bool {
        self.order.lock().contains(&object)
    }

    pub fn cleanup_runs(&self) -> u64 {
        self.cleanup_runs.load(Ordering::Relaxed)
    }

    pub fn cleanup_skips(&self) -> u64 {
        self.cleanup_skips.load(Ordering::Relaxed)
    }

    /// Start tracking a sized association
    ///
    /// The object becomes the most recently used one. If it is already
    /// tracked through another association, the budgets only grow by the
    /// amount its largest size increased.
    pub fn record_add(&self, association: &Arc<CachedAssociation<K>>) {
        if !association.is_sized() {
            return;
        }

        let id = association.object_id();
        let mut order = self.order.lock();
        let (grow_vm, grow_gpu) = match order.get_mut(&id) {
            Some(entry) => entry.absorb(association.clone()),
            None => {
                order.put(id, RecencyEntry::new(association.clone()));
                (association.size_vm(), association.size_gpu())
            }
        };
        self.vm.record_allocation(grow_vm);
        self.gpu.record_allocation(grow_gpu);
    }

    /// Mark an object as most recently used
    ///
    /// Does nothing if the object was evicted concurrently or was never
    /// tracked.
    pub fn record_use(&self, object: ObjectId) {
        self.order.lock().promote(&object);
    }

    /// Mark several objects as used, in order
    pub fn record_use_all<I>(&self, objects: I)
    where
        I: IntoIterator<Item = ObjectId>,
    {
        let mut order = self.order.lock();
        for object in objects {
            order.promote(&object);
        }
    }

    /// Stop tracking one association
    pub fn record_remove(&self, association: &Arc<CachedAssociation<K>>) {
        self.record_remove_all(std::slice::from_ref(association));
    }

    /// Stop tracking several associations
    ///
    /// Associations the tracker does not know about (unsized, already
    /// evicted, or never added) are ignored.
    pub fn record_remove_all(&self, associations: &[Arc<CachedAssociation<K>>]) {
        let mut by_object: HashMap<ObjectId, Vec<&Arc<CachedAssociation<K>>>> = HashMap::new();
        for association in associations.iter().filter(|a| a.is_sized()) {
            by_object
                .entry(association.object_id())
                .or_default()
                .push(association);
        }
        if by_object.is_empty() {
            return;
        }

        let mut order = self.order.lock();
        for (id, removed) in by_object {
            let detached = match order.peek_mut(&id) {
                Some(entry) => entry.detach(&removed),
                None => continue,
            };

            match detached {
                Detached::NotMember => {}
                Detached::Emptied => {
                    if let Some(entry) = order.pop(&id) {
                        self.vm.record_deallocation(entry.max_vm);
                        self.gpu.record_deallocation(entry.max_gpu);
                    }
                }
                Detached::Shrunk { vm, gpu } => {
                    self.vm.record_deallocation(vm);
                    self.gpu.record_deallocation(gpu);
                }
            }
        }
    }

    /// Run one eviction pass
    ///
    /// Each dimension is checked on its own, VM first. A dimension over its
    /// ceiling evicts least recently used objects that cost memory in that
    /// dimension. Objects are taken while the dimension is still over its
    /// ceiling, and after that only while they fit into the distance to the
    /// low-water mark. Evicting an object frees its memory in both
    /// dimensions.
    ///
    /// Objects with exactly equal recency cannot occur, but objects of equal
    /// size are chosen purely by recency order; there is no other tie-break.
    ///
    /// If another pass is already running this returns immediately with
    /// [`CleanupReport::skipped`] set.
    pub fn cleanup(&self) -> CleanupReport {
        let Some(_guard) = CleanupGuard::acquire(&self.cleaning) else {
            self.cleanup_skips.fetch_add(1, Ordering::Relaxed);
            trace!("cache cleanup already running, skipping cycle");
            return CleanupReport::skipped();
        };
        self.cleanup_runs.fetch_add(1, Ordering::Relaxed);

        let mut report = CleanupReport::default();
        for dimension in Dimension::ALL {
            let batch = self.select_victims(dimension, &mut report);
            if batch.is_empty() {
                continue;
            }

            report.evicted_associations += batch.len();
            match self.sink.upgrade() {
                Some(sink) => sink.evict(batch),
                None => trace!("eviction sink is gone, dropping {} associations", batch.len()),
            }
        }

        report
    }

    /// Pick and forget the eviction batch for one dimension
    fn select_victims(
        &self,
        dimension: Dimension,
        report: &mut CleanupReport,
    ) -> Vec<Arc<CachedAssociation<K>>> {
        let budget = self.budget(dimension);
        let mut order = self.order.lock();

        let current = budget.current();
        let ceiling = match budget.ceiling() {
            Some(ceiling) if current > ceiling => ceiling,
            _ => return Vec::new(),
        };
        let low_water = budget.low_water().unwrap_or(ceiling);
        let must_free = current - ceiling;
        let to_free = current.saturating_sub(low_water);

        let mut selected: u64 = 0;
        let mut victims = Vec::new();
        for (id, entry) in order.iter().rev() {
            if selected >= must_free && selected >= to_free {
                break;
            }
            let size = entry.max_size(dimension);
            if size == 0 {
                continue;
            }
            if selected >= must_free && selected.saturating_add(size) > to_free {
                break;
            }
            victims.push(*id);
            selected = selected.saturating_add(size);
        }

        let mut evicted = Vec::new();
        for id in &victims {
            if let Some(entry) = order.pop(id) {
                self.vm.record_deallocation(entry.max_vm);
                self.gpu.record_deallocation(entry.max_gpu);
                report.freed_vm += entry.max_vm;
                report.freed_gpu += entry.max_gpu;
                report.evicted_objects += 1;
                evicted.extend(entry.members);
            }
        }
        drop(order);

        debug!(
            dimension = %dimension,
            objects = victims.len(),
            freed = selected,
            current = budget.current(),
            ceiling,
            low_water,
            "evicting least recently used cache objects"
        );
        evicted
    }

    /// Tracked objects from least to most recently used
    #[cfg(test)]
    fn lru_order(&self) -> Vec<ObjectId> {
        self.order.lock().iter().rev().map(|(id, _)| *id).collect()
    }
}
