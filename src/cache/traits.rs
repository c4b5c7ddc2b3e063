//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::key::CacheKey;

/// Trait for entities that can be cached.
///
/// Besides the canonical entry, an entity may declare derived sub-views and
/// secondary-index keys. All of them are written together and invalidated
/// together.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Entity type name for storage organization (e.g., "user", "team")
  fn entity_type() -> &'static str;

  /// Unique identifier for this entity within its type
  fn cache_id(&self) -> String;

  /// Derived views cached under `(type, id, name)`, e.g. a user's profile.
  fn sub_views(&self) -> Vec<(&'static str, Value)> {
    Vec::new()
  }

  /// Secondary lookups as `(index name, value)`, e.g. `("email", ...)`.
  fn secondary_keys(&self) -> Vec<(&'static str, String)> {
    Vec::new()
  }

  fn canonical_key(&self) -> CacheKey {
    CacheKey::entity(Self::entity_type(), self.cache_id())
  }
}

/// A durable cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub value: T,
  pub cached_at: DateTime<Utc>,
  pub ttl: Duration,
  /// Cache format version the entry was written with
  pub version: u32,
}

impl<T> CacheEntry<T> {
  pub fn new(value: T, ttl: Duration, version: u32) -> Self {
    Self {
      value,
      cached_at: Utc::now(),
      ttl,
      version,
    }
  }

  /// Stale when older than its TTL or written with another format version.
  pub fn is_stale(&self, now: DateTime<Utc>, current_version: u32) -> bool {
    now - self.cached_at > self.ttl || self.version != current_version
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

/// Change notification from the reactive tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  Updated(CacheKey),
  Invalidated(CacheKey),
  /// Every key was dropped (logout)
  Cleared,
}
