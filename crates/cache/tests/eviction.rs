use std::sync::Arc;

use butterpaper_cache::{
    CacheEvent, CacheListener, CacheType, CachedObject, ChangeFilter, Dimension,
    ListenerRegistration, ObjectCache, ObjectId,
};
use parking_lot::Mutex;
use rand::Rng;

/// Cached payload that remembers the sizes it was cached with
#[derive(Debug, PartialEq)]
struct Blob {
    id: u32,
    vm: u64,
    gpu: u64,
}

impl Blob {
    fn new(id: u32, vm: u64, gpu: u64) -> Arc<Self> {
        Arc::new(Self { id, vm, gpu })
    }
}

fn blob_type() -> CacheType {
    CacheType::of::<Blob>()
}

fn put_blob(cache: &ObjectCache<u32>, key: u32, blob: &Arc<Blob>) {
    cache.put_typed(key, blob.clone(), blob.vm, blob.gpu);
}

/// Collects the payloads of every removal event
struct RemovalLog {
    removed: Arc<Mutex<Vec<CachedObject>>>,
    _listener: Arc<dyn CacheListener>,
    _registration: ListenerRegistration,
}

impl RemovalLog {
    fn attach(cache: &ObjectCache<u32>) -> Self {
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        let listener = Arc::new(move |event: &CacheEvent| {
            sink.lock().extend(event.objects.iter().cloned());
        });
        let registration = cache.register_listener(&listener, ChangeFilter::Removal, blob_type());
        Self {
            removed,
            _listener: listener,
            _registration: registration,
        }
    }

    fn blobs(&self) -> Vec<(u32, u64)> {
        self.removed
            .lock()
            .iter()
            .filter_map(|object| object.downcast_ref::<Blob>())
            .map(|blob| (blob.id, blob.vm))
            .collect()
    }
}

#[test]
fn scenario_evicts_down_to_low_water() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    cache.set_ceiling(Dimension::Vm, 1000);
    cache.set_low_water(Dimension::Vm, 400);

    let blobs: Vec<_> = (1..=4).map(|id| Blob::new(id, 300, 0)).collect();
    for blob in &blobs {
        put_blob(&cache, blob.id, blob);
    }
    assert_eq!(cache.budget(Dimension::Vm).current(), 1200);

    let report = cache.cleanup();
    assert_eq!(report.evicted_objects, 2);
    assert_eq!(cache.budget(Dimension::Vm).current(), 600);

    assert!(cache.get_typed::<Blob>(&1).is_none());
    assert!(cache.get_typed::<Blob>(&2).is_none());
    assert_eq!(cache.get_typed::<Blob>(&3).as_deref(), Some(&*blobs[2]));
    assert_eq!(cache.get_typed::<Blob>(&4).as_deref(), Some(&*blobs[3]));
}

#[test]
fn least_recently_inserted_goes_first() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    for id in 1..=3 {
        put_blob(&cache, id, &Blob::new(id, 100, 0));
    }

    // Forces exactly one eviction
    cache.set_ceiling(Dimension::Vm, 250);
    cache.set_low_water(Dimension::Vm, 200);
    cache.cleanup();

    assert!(!cache.contains(&1, blob_type()));
    assert!(cache.contains(&2, blob_type()));
    assert!(cache.contains(&3, blob_type()));
}

#[test]
fn get_protects_from_eviction() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    for id in 1..=3 {
        put_blob(&cache, id, &Blob::new(id, 100, 0));
    }
    assert!(cache.get_typed::<Blob>(&1).is_some());

    cache.set_ceiling(Dimension::Vm, 250);
    cache.set_low_water(Dimension::Vm, 200);
    cache.cleanup();

    assert!(cache.contains(&1, blob_type()));
    assert!(!cache.contains(&2, blob_type()));
    assert!(cache.contains(&3, blob_type()));
}

#[test]
fn equal_values_are_distinct_objects() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    let first = Blob::new(1, 100, 0);
    let twin = Blob::new(1, 100, 0);
    assert_eq!(first, twin);

    put_blob(&cache, 1, &first);
    put_blob(&cache, 2, &twin);
    assert_eq!(cache.stats().tracked_objects, 2);
    assert_eq!(cache.budget(Dimension::Vm).current(), 200);

    cache.set_ceiling(Dimension::Vm, 150);
    cache.set_low_water(Dimension::Vm, 100);
    cache.cleanup();

    // Only the older binding is gone even though the values are equal
    assert!(!cache.contains(&1, blob_type()));
    assert!(cache.contains(&2, blob_type()));
}

#[test]
fn shared_object_is_counted_and_evicted_once() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    let removed = RemovalLog::attach(&cache);

    let shared = Blob::new(1, 400, 40);
    put_blob(&cache, 1, &shared);
    put_blob(&cache, 2, &shared);
    cache.put(9, shared.clone(), CacheType::of::<str>(), 400, 40);
    put_blob(&cache, 3, &Blob::new(3, 100, 10));

    let stats = cache.stats();
    assert_eq!(stats.associations, 4);
    assert_eq!(stats.tracked_objects, 2);
    assert_eq!(stats.vm.current, 500);
    assert_eq!(stats.gpu.current, 50);

    cache.set_ceiling(Dimension::Vm, 300);
    let report = cache.cleanup();

    assert_eq!(report.evicted_objects, 1);
    assert_eq!(report.evicted_associations, 3);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.budget(Dimension::Vm).current(), 100);
    assert_eq!(cache.budget(Dimension::Gpu).current(), 10);
    // Two Blob bindings in one event, the str binding went to its own type
    assert_eq!(removed.blobs(), vec![(1, 400), (1, 400)]);
    assert_eq!(cache.stats().evictions, 3);
}

#[test]
fn gpu_pressure_evicts_gpu_objects_only() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    put_blob(&cache, 1, &Blob::new(1, 500, 0));
    put_blob(&cache, 2, &Blob::new(2, 50, 300));
    put_blob(&cache, 3, &Blob::new(3, 50, 300));

    cache.set_ceiling(Dimension::Gpu, 400);
    cache.set_low_water(Dimension::Gpu, 300);
    let report = cache.cleanup();

    assert!(cache.contains(&1, blob_type()));
    assert!(!cache.contains(&2, blob_type()));
    assert!(cache.contains(&3, blob_type()));
    assert_eq!(report.freed_gpu, 300);
    assert_eq!(report.freed_vm, 50);
    assert_eq!(cache.budget(Dimension::Vm).current(), 550);
}

#[test]
fn both_dimensions_are_cleaned_in_one_pass() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    put_blob(&cache, 1, &Blob::new(1, 400, 0));
    put_blob(&cache, 2, &Blob::new(2, 0, 400));
    put_blob(&cache, 3, &Blob::new(3, 400, 0));
    put_blob(&cache, 4, &Blob::new(4, 0, 400));

    cache.set_ceiling(Dimension::Vm, 500);
    cache.set_ceiling(Dimension::Gpu, 500);
    let report = cache.cleanup();

    assert_eq!(report.evicted_objects, 2);
    assert!(!cache.contains(&1, blob_type()));
    assert!(!cache.contains(&2, blob_type()));
    assert_eq!(cache.budget(Dimension::Vm).current(), 400);
    assert_eq!(cache.budget(Dimension::Gpu).current(), 400);
}

#[test]
fn limits_can_change_between_cleanups() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    for id in 0..10 {
        put_blob(&cache, id, &Blob::new(id, 100, 0));
    }

    cache.set_ceiling(Dimension::Vm, 900);
    cache.cleanup();
    // 80% default low-water of 900
    assert_eq!(cache.budget(Dimension::Vm).current(), 800);

    cache.set_ceiling(Dimension::Vm, 2000);
    assert!(!cache.cleanup().evicted_anything());

    cache.set_ceiling(Dimension::Vm, 500);
    cache.set_low_water(Dimension::Vm, 100);
    cache.cleanup();
    assert_eq!(cache.budget(Dimension::Vm).current(), 100);
}

#[test]
fn random_budgets_converge_within_bounds() {
    let mut rng = rand::thread_rng();

    for _ in 0..50 {
        let cache: ObjectCache<u32> = ObjectCache::new();
        let removed = RemovalLog::attach(&cache);

        let count = rng.gen_range(1..40);
        for id in 0..count {
            let blob = Blob::new(id, rng.gen_range(0..500), 0);
            put_blob(&cache, id, &blob);
            if rng.gen_bool(0.3) {
                let _ = cache.get_typed::<Blob>(&rng.gen_range(0..=id));
            }
        }

        let before = cache.budget(Dimension::Vm).current();
        let ceiling = rng.gen_range(0..=before.max(1));
        let low_water = rng.gen_range(0..=ceiling);
        cache.set_ceiling(Dimension::Vm, ceiling);
        cache.set_low_water(Dimension::Vm, low_water);

        cache.cleanup();
        let after = cache.budget(Dimension::Vm).current();

        // Converges below the ceiling unless nothing sized is left
        assert!(after <= ceiling || cache.stats().tracked_objects == 0);

        let evicted = removed.blobs();
        if let Some(largest) = evicted.iter().map(|&(_, vm)| vm).max() {
            // Never undershoots the low-water mark by more than one object
            assert!(
                after + largest >= low_water,
                "after={after} largest={largest} low={low_water}"
            );

            let freed: u64 = evicted.iter().map(|&(_, vm)| vm).sum();
            assert_eq!(before - freed, after);
        } else {
            assert!(before <= ceiling);
        }
    }
}

#[test]
fn eviction_order_matches_recency() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    let removed = RemovalLog::attach(&cache);

    for id in 0..6 {
        put_blob(&cache, id, &Blob::new(id, 10, 0));
    }
    // Recency order is now 1, 3, 5, 0, 2, 4 (oldest first)
    for id in [0, 2, 4] {
        let _ = cache.get_typed::<Blob>(&id);
    }

    cache.set_ceiling(Dimension::Vm, 30);
    cache.set_low_water(Dimension::Vm, 30);
    cache.cleanup();

    let mut evicted: Vec<u32> = removed.blobs().into_iter().map(|(id, _)| id).collect();
    evicted.sort_unstable();
    assert_eq!(evicted, vec![1, 3, 5]);
}

#[test]
fn identity_survives_type_erasure() {
    let cache: ObjectCache<u32> = ObjectCache::new();
    let blob = Blob::new(1, 10, 0);
    put_blob(&cache, 1, &blob);

    let erased = cache.get(&1, blob_type()).unwrap();
    assert_eq!(ObjectId::of(&erased), ObjectId::of_typed(&blob));
}
