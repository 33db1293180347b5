//! Change notification for cache insertions and removals
//!
//! Listeners subscribe per cache type and per change kind. Registries hold
//! listeners weakly, so a listener that nobody else owns stops receiving
//! events without being deregistered, and the cache never keeps a listener
//! (or whatever it captures) alive.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::association::{CacheType, CachedObject};

/// Kind of change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insertion,
    Removal,
}

/// Which changes a listener wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeFilter {
    Insertion,
    Removal,
    /// Both insertions and removals
    All,
}

impl ChangeFilter {
    pub fn accepts(&self, change: ChangeKind) -> bool {
        matches!(
            (self, change),
            (ChangeFilter::All, _)
                | (ChangeFilter::Insertion, ChangeKind::Insertion)
                | (ChangeFilter::Removal, ChangeKind::Removal)
        )
    }
}

/// A batch of objects inserted into or removed from one cache type
#[derive(Clone)]
pub struct CacheEvent {
    pub cache_type: CacheType,
    pub change: ChangeKind,
    pub objects: Vec<CachedObject>,
}

impl fmt::Debug for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEvent")
            .field("cache_type", &self.cache_type)
            .field("change", &self.change)
            .field("objects", &self.objects.len())
            .finish()
    }
}

/// Receiver of cache change events.
///
/// Called on the thread that made the change, which is the cleanup timer
/// thread for evictions. No cache lock is held during the call, so the
/// listener may use the cache again.
pub trait CacheListener: Send + Sync {
    fn cache_changed(&self, event: &CacheEvent);
}

impl<F> CacheListener for F
where
    F: Fn(&CacheEvent) + Send + Sync,
{
    fn cache_changed(&self, event: &CacheEvent) {
        self(event)
    }
}

/// Handle of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerSlot {
    id: ListenerId,
    listener: Weak<dyn CacheListener>,
}

impl ListenerSlot {
    fn address(&self) -> usize {
        Weak::as_ptr(&self.listener) as *const () as usize
    }
}

type Registry = Mutex<HashMap<CacheType, Vec<ListenerSlot>>>;

/// Listener registry and event dispatch.
///
/// Insertion and removal listeners live in separate registries with their
/// own locks. Dispatch copies the matching listeners out under the lock and
/// calls them after releasing it.
pub struct ChangeNotifier {
    next_id: AtomicU64,
    insertion: Registry,
    removal: Registry,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            insertion: Mutex::new(HashMap::new()),
            removal: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self, change: ChangeKind) -> &Registry {
        match change {
            ChangeKind::Insertion => &self.insertion,
            ChangeKind::Removal => &self.removal,
        }
    }

    /// Register a listener for changes of `cache_type`
    ///
    /// Only a weak reference is kept; the caller owns the listener. A
    /// listener registered several times for the same type still receives
    /// each event once.
    pub fn register<L>(
        &self,
        listener: &Arc<L>,
        filter: ChangeFilter,
        cache_type: CacheType,
    ) -> ListenerId
    where
        L: CacheListener + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn CacheListener> = weak;

        for change in [ChangeKind::Insertion, ChangeKind::Removal] {
            if !filter.accepts(change) {
                continue;
            }
            let mut registry = self.registry(change).lock();
            let slots = registry.entry(cache_type).or_default();
            slots.retain(|slot| slot.listener.strong_count() > 0);
            slots.push(ListenerSlot {
                id,
                listener: weak.clone(),
            });
        }

        id
    }

    /// Register a listener and tie the registration to the returned guard
    pub fn subscribe<L>(
        self: &Arc<Self>,
        listener: &Arc<L>,
        filter: ChangeFilter,
        cache_type: CacheType,
    ) -> ListenerRegistration
    where
        L: CacheListener + 'static,
    {
        let id = self.register(listener, filter, cache_type);
        ListenerRegistration {
            id,
            notifier: Arc::downgrade(self),
        }
    }

    /// Remove one registration
    ///
    /// Returns true if it was still registered.
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut found = false;
        for change in [ChangeKind::Insertion, ChangeKind::Removal] {
            let mut registry = self.registry(change).lock();
            registry.retain(|_, slots| {
                let before = slots.len();
                slots.retain(|slot| slot.id != id);
                found |= slots.len() != before;
                !slots.is_empty()
            });
        }
        found
    }

    /// Remove every registration of `listener` for `cache_type`
    ///
    /// Returns the number of registrations removed.
    pub fn deregister_listener<L>(&self, listener: &Arc<L>, cache_type: CacheType) -> usize
    where
        L: CacheListener + 'static,
    {
        let address = Arc::as_ptr(listener) as *const () as usize;
        let mut removed = 0;
        for change in [ChangeKind::Insertion, ChangeKind::Removal] {
            let mut registry = self.registry(change).lock();
            if let Some(slots) = registry.get_mut(&cache_type) {
                let before = slots.len();
                slots.retain(|slot| slot.address() != address);
                removed += before - slots.len();
                if slots.is_empty() {
                    registry.remove(&cache_type);
                }
            }
        }
        removed
    }

    /// Returns true if any live listener wants `change` events for `cache_type`
    pub fn has_listeners(&self, cache_type: CacheType, change: ChangeKind) -> bool {
        self.registry(change)
            .lock()
            .get(&cache_type)
            .is_some_and(|slots| slots.iter().any(|slot| slot.listener.strong_count() > 0))
    }

    /// Deliver a change to the listeners of `cache_type`
    ///
    /// Empty batches are not delivered. A panicking listener is logged and
    /// does not prevent delivery to the others.
    pub fn notify(&self, cache_type: CacheType, change: ChangeKind, objects: Vec<CachedObject>) {
        if objects.is_empty() {
            return;
        }
        let listeners = self.snapshot(cache_type, change);
        if listeners.is_empty() {
            return;
        }

        let event = CacheEvent {
            cache_type,
            change,
            objects,
        };
        for listener in listeners {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| listener.cache_changed(&event)));
            if delivered.is_err() {
                warn!(cache_type = %cache_type, ?change, "cache listener panicked");
            }
        }
    }

    /// Live listeners for a type, deduplicated, pruning dead registrations
    fn snapshot(&self, cache_type: CacheType, change: ChangeKind) -> Vec<Arc<dyn CacheListener>> {
        let mut registry = self.registry(change).lock();
        let Some(slots) = registry.get_mut(&cache_type) else {
            return Vec::new();
        };

        slots.retain(|slot| slot.listener.strong_count() > 0);
        let mut seen = Vec::with_capacity(slots.len());
        let mut listeners = Vec::with_capacity(slots.len());
        for slot in slots.iter() {
            let address = slot.address();
            if seen.contains(&address) {
                continue;
            }
            if let Some(listener) = slot.listener.upgrade() {
                seen.push(address);
                listeners.push(listener);
            }
        }

        if slots.is_empty() {
            registry.remove(&cache_type);
        }
        listeners
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped listener registration.
///
/// Deregisters the listener when dropped. Use [`ListenerRegistration::detach`]
/// to keep the registration for as long as the listener itself is alive.
#[must_use = "dropping the registration deregisters the listener"]
pub struct ListenerRegistration {
    id: ListenerId,
    notifier: Weak<ChangeNotifier>,
}

impl ListenerRegistration {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Keep the registration without a guard
    ///
    /// It ends when the listener is dropped or is deregistered explicitly.
    pub fn detach(mut self) -> ListenerId {
        self.notifier = Weak::new();
        self.id
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.deregister(self.id);
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .field("attached", &(self.notifier.strong_count() > 0))
            .finish()
    }
}
