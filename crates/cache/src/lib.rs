//! ButterPaper Object Cache
//!
//! In-process cache for expensive derived artifacts (tessellations, glyph
//! outlines, uploaded textures) keyed by `(key, type)`, with separate
//! process-memory and GPU-memory budgets and least-recently-used eviction
//! driven by a background cleanup timer.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use butterpaper_cache::{CacheConfig, ObjectCache};
//!
//! struct Outline(Vec<(f32, f32)>);
//!
//! let config = CacheConfig::new(256, 512).with_cleanup_interval(Some(Duration::from_millis(500)));
//! let cache: ObjectCache<u32> = ObjectCache::with_config(&config).unwrap();
//!
//! cache.put_typed(7, Arc::new(Outline(vec![(0.0, 0.0)])), 1024, 0);
//! assert!(cache.get_typed::<Outline>(&7).is_some());
//!
//! cache.close();
//! ```

pub mod association;
pub mod budget;
pub mod config;
pub mod error;
pub mod notify;
pub mod recency;
pub mod store;
pub mod timer;

pub use association::{CacheType, CachedAssociation, CachedObject, ObjectId};
pub use budget::{BudgetState, BudgetStats, Dimension, MemoryPressure, DEFAULT_LOW_WATER_RATIO};
pub use config::{BudgetLimits, CacheConfig, ConfigError};
pub use error::CacheError;
pub use notify::{
    CacheEvent, CacheListener, ChangeFilter, ChangeKind, ChangeNotifier, ListenerId,
    ListenerRegistration,
};
pub use recency::{CleanupReport, EvictionSink, RecencyTracker};
pub use store::{CacheKey, CacheStats, ObjectCache};
pub use timer::CleanupTimer;
