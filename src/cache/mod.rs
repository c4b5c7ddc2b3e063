//! Two-tier entity cache.
//!
//! This module provides a domain-agnostic caching mechanism that:
//! - Caches entities under hierarchical keys (canonical, sub-views, secondary indexes)
//! - Keeps a reactive in-process tier and a durable SQLite tier consistent
//! - Cascades invalidation to every key recorded for an entity
//! - Provides basic offline mode (serve an expired durable copy when the network fails)

mod key;
mod layer;
mod reactive;
mod storage;
mod traits;

pub use key::{CacheKey, KeyPrefix};
pub use layer::{merge_patch, CacheSync};
pub use reactive::ReactiveTier;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheEntry, CacheEvent, CacheResult, CacheSource, Cacheable};
