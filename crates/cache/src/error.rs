//! Error types for the object cache

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors from constructing or starting a cache.
///
/// Cache operations themselves never fail; a miss is `None`.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn cache cleanup thread: {0}")]
    TimerSpawn(#[source] io::Error),
}
