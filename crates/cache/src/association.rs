//! Cache associations and object identity
//!
//! An association binds a `(key, type)` pair to a cached object together with
//! the memory the object occupies in process memory (VM) and on the graphics
//! device (GPU). Associations are immutable: re-binding a key creates a new
//! association rather than editing the old one.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::budget::Dimension;

/// A cached artifact as stored by the cache.
///
/// The cache never looks inside the object. Two objects are the same cache
/// object only if they are the same allocation (see [`ObjectId`]).
pub type CachedObject = Arc<dyn Any + Send + Sync>;

/// Identity of a cached object.
///
/// Derived from the address of the shared allocation, so two objects that
/// compare equal by value are still distinct cache objects. The address is
/// stable for as long as any association keeps the object alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Get the identity of a cached object
    pub fn of(object: &CachedObject) -> Self {
        Self(Arc::as_ptr(object) as *const () as usize)
    }

    /// Get the identity of a typed object before it is erased
    pub fn of_typed<T: Any + Send + Sync>(object: &Arc<T>) -> Self {
        Self(Arc::as_ptr(object) as *const () as usize)
    }
}

/// Association type tag.
///
/// Keys are unique within one cache type. A type can be any Rust type,
/// including trait objects, so one object may be cached under its concrete
/// type and under an interface it implements at the same time:
///
/// ```
/// use butterpaper_cache::CacheType;
///
/// trait Geometry {}
/// struct Polygon;
///
/// let concrete = CacheType::of::<Polygon>();
/// let interface = CacheType::of::<dyn Geometry>();
/// assert_ne!(concrete, interface);
/// ```
#[derive(Clone, Copy)]
pub struct CacheType {
    id: TypeId,
    name: &'static str,
}

impl CacheType {
    /// Get the cache type for `T`
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Readable name of the type, for logging
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for CacheType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CacheType {}

impl Hash for CacheType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheType").field(&self.name).finish()
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// One `(key, type) -> object` binding with its memory footprint.
pub struct CachedAssociation<K> {
    key: K,
    cache_type: CacheType,
    object: CachedObject,
    object_id: ObjectId,
    size_vm: u64,
    size_gpu: u64,
}

impl<K> CachedAssociation<K> {
    /// Create a new association
    ///
    /// # Arguments
    ///
    /// * `key` - Key of the association, unique within `cache_type`
    /// * `cache_type` - Association type
    /// * `object` - The cached object
    /// * `size_vm` - Process memory used by the object in bytes
    /// * `size_gpu` - Graphics memory used by the object in bytes
    pub fn new(
        key: K,
        cache_type: CacheType,
        object: CachedObject,
        size_vm: u64,
        size_gpu: u64,
    ) -> Self {
        let object_id = ObjectId::of(&object);
        Self {
            key,
            cache_type,
            object,
            object_id,
            size_vm,
            size_gpu,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn object(&self) -> &CachedObject {
        &self.object
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn size_vm(&self) -> u64 {
        self.size_vm
    }

    pub fn size_gpu(&self) -> u64 {
        self.size_gpu
    }

    /// Size of the object in the given budget dimension
    pub fn size(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Vm => self.size_vm,
            Dimension::Gpu => self.size_gpu,
        }
    }

    /// Returns true if the association costs memory in at least one dimension.
    ///
    /// Unsized associations are purely logical and are never tracked for
    /// eviction.
    pub fn is_sized(&self) -> bool {
        self.size_vm > 0 || self.size_gpu > 0
    }

    /// Returns true if this association already binds `object` with the same sizes.
    pub fn same_binding(&self, object: &CachedObject, size_vm: u64, size_gpu: u64) -> bool {
        self.object_id == ObjectId::of(object)
            && self.size_vm == size_vm
            && self.size_gpu == size_gpu
    }
}

impl<K: fmt::Debug> fmt::Debug for CachedAssociation<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedAssociation")
            .field("key", &self.key)
            .field("cache_type", &self.cache_type)
            .field("object_id", &self.object_id)
            .field("size_vm", &self.size_vm)
            .field("size_gpu", &self.size_gpu)
            .finish()
    }
}
