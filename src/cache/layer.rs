//! Cache synchronizer that keeps the reactive and durable tiers consistent.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::key::{CacheKey, KeyPrefix};
use super::reactive::ReactiveTier;
use super::storage::{CacheStorage, NoopStorage, SqliteStorage};
use super::traits::{CacheEntry, CacheEvent, CacheResult, Cacheable};
use crate::config::CacheConfig;
use crate::error::OpResult;

/// Session-wide two-tier entity cache.
///
/// Tier A ([`ReactiveTier`]) is authoritative for read-after-write inside the
/// session and notifies subscribers. Tier B ([`CacheStorage`]) survives restarts;
/// its failures are logged and never surface to callers. Both tiers expire an
/// entry at the same instant, `cached_at + ttl`.
///
/// Index keys belong to the entity that wrote them last: invalidating or
/// re-caching one entity never drops an index key another entity took over.
///
/// Build one per session, share it via `Arc`, and call [`CacheSync::logout`]
/// when the session ends.
pub struct CacheSync {
  tier_a: ReactiveTier,
  tier_b: Arc<dyn CacheStorage>,
  /// How long before durable entries are considered stale
  ttl: Duration,
  /// Format version; entries written with another version are stale
  version: u32,
}

impl CacheSync {
  /// Create a synchronizer over the given durable backend.
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      tier_a: ReactiveTier::new(),
      tier_b: Arc::new(storage),
      ttl: Duration::minutes(5),
      version: 1,
    }
  }

  /// Synchronizer with no durable tier.
  pub fn memory_only() -> Self {
    Self::new(NoopStorage)
  }

  pub fn from_config(config: &CacheConfig) -> Result<Self> {
    let sync = if config.enabled {
      let storage = match &config.path {
        Some(path) => SqliteStorage::open(path)?,
        None => SqliteStorage::open_default()?,
      };
      Self::new(storage)
    } else {
      Self::memory_only()
    };

    let ttl_secs = i64::try_from(config.ttl_secs)
      .map_err(|_| eyre!("cache.ttl_secs is out of range: {}", config.ttl_secs))?;

    Ok(
      sync
        .with_ttl(Duration::seconds(ttl_secs))
        .with_version(config.version),
    )
  }

  /// Set the TTL for durable entries.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_version(mut self, version: u32) -> Self {
    self.version = version;
    self
  }

  /// Subscribe to tier A change events.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.tier_a.subscribe()
  }

  // ==========================================================================
  // Key-level access
  // ==========================================================================

  /// Read a key. Falls through to tier B on a tier A miss and backfills A.
  ///
  /// Missing, stale and unreadable entries all read as `None`.
  pub fn get_value(&self, key: &CacheKey) -> Option<Value> {
    self.lookup(key).map(|(value, _)| value)
  }

  /// Read a key and deserialize it.
  pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
    let value = self.get_value(key)?;
    match serde_json::from_value(value) {
      Ok(data) => Some(data),
      Err(e) => {
        warn!(key = %key, "cached value has unexpected shape: {}", e);
        None
      }
    }
  }

  /// Read an entity by id.
  pub fn entity<E: Cacheable>(&self, id: &str) -> Option<E> {
    self.get(&CacheKey::entity(E::entity_type(), id))
  }

  /// Write a single key to both tiers.
  pub fn set(&self, key: CacheKey, value: Value) {
    let entry = CacheEntry::new(value, self.ttl, self.version);
    if let Err(e) = self.tier_b.put(&key, &entry) {
      warn!(key = %key, "durable cache write failed: {:#}", e);
    }
    let expires_at = entry.cached_at + entry.ttl;
    self
      .tier_a
      .insert(key, entry.value, entry.cached_at, Some(expires_at));
  }

  /// Invalidate a single key in both tiers.
  pub fn invalidate_key(&self, key: &CacheKey) {
    self.tier_a.invalidate(key);
    if let Err(e) = self.tier_b.remove(None, std::slice::from_ref(key)) {
      warn!(key = %key, "durable cache invalidation failed: {:#}", e);
    }
  }

  /// Invalidate every key under `prefix` in both tiers.
  pub fn invalidate_many(&self, prefix: &KeyPrefix) -> usize {
    let invalidated = self.tier_a.invalidate_many(prefix);
    match self.tier_b.remove_prefix(prefix) {
      Ok(removed) => invalidated.max(removed),
      Err(e) => {
        warn!(prefix = ?prefix, "durable cache invalidation failed: {:#}", e);
        invalidated
      }
    }
  }

  // ==========================================================================
  // Entity-level access
  // ==========================================================================

  /// Write an entity's canonical key, sub-views and secondary-index keys.
  ///
  /// Tier A is written under one lock, so readers see either the old or the
  /// new entity. Keys from the previous write that no longer apply (e.g. an
  /// old email index) are invalidated.
  pub fn cache_entity<E: Cacheable>(&self, entity: &E) -> Result<()> {
    let canonical = entity.canonical_key();
    let value = serde_json::to_value(entity)
      .map_err(|e| eyre!("Failed to serialize {}: {}", canonical, e))?;

    let mut entries = vec![(canonical.clone(), value.clone())];
    for (name, view) in entity.sub_views() {
      entries.push((
        CacheKey::sub_view(E::entity_type(), entity.cache_id(), name),
        view,
      ));
    }
    for (index, lookup) in entity.secondary_keys() {
      entries.push((
        CacheKey::index(E::entity_type(), index, lookup),
        value.clone(),
      ));
    }

    let current: BTreeSet<&CacheKey> = entries.iter().map(|(key, _)| key).collect();
    let leaked: Vec<CacheKey> = self
      .recorded_keys(&canonical)
      .into_iter()
      .filter(|key| !current.contains(key))
      .collect();

    self
      .tier_a
      .write_entity(&canonical, &entries, Some(Utc::now() + self.ttl));
    self.tier_a.invalidate_entity(&canonical, &leaked);

    let durable: Vec<(CacheKey, CacheEntry<Value>)> = entries
      .into_iter()
      .map(|(key, value)| (key, CacheEntry::new(value, self.ttl, self.version)))
      .collect();
    if let Err(e) = self.tier_b.write_entity(&canonical, &durable) {
      warn!(key = %canonical, "durable cache write failed: {:#}", e);
    }
    if !leaked.is_empty() {
      if let Err(e) = self.tier_b.remove(Some(&canonical), &leaked) {
        warn!(key = %canonical, "durable cache cleanup failed: {:#}", e);
      }
    }

    debug!(key = %canonical, keys = durable.len(), "cached entity");
    Ok(())
  }

  /// Invalidate an entity with every key recorded at its last write.
  pub fn invalidate<E: Cacheable>(&self, id: &str) -> usize {
    self.invalidate_entity(E::entity_type(), id)
  }

  /// Untyped form of [`CacheSync::invalidate`].
  pub fn invalidate_entity(&self, entity_type: &str, id: &str) -> usize {
    let canonical = CacheKey::entity(entity_type, id);
    let keys: Vec<CacheKey> = self.recorded_keys(&canonical).into_iter().collect();

    let invalidated = self.tier_a.invalidate_entity(&canonical, &keys);
    if let Err(e) = self.tier_b.remove(Some(&canonical), &keys) {
      warn!(key = %canonical, "durable cache invalidation failed: {:#}", e);
    }

    info!(key = %canonical, keys = keys.len(), "invalidated entity");
    invalidated
  }

  /// Merge a JSON patch into the cached entity and re-cache it.
  ///
  /// Returns `None` when the entity is not cached.
  pub fn update_entity<E: Cacheable>(&self, id: &str, patch: &Value) -> Result<Option<E>> {
    let key = CacheKey::entity(E::entity_type(), id);
    let Some(mut current) = self.get_value(&key) else {
      return Ok(None);
    };

    merge_patch(&mut current, patch);
    let entity: E =
      serde_json::from_value(current).map_err(|e| eyre!("Patch for {} is invalid: {}", key, e))?;

    self.cache_entity(&entity)?;
    Ok(Some(entity))
  }

  /// Fetch a single entity with caching.
  ///
  /// 1. Fresh in either tier: return it without calling the fetcher
  /// 2. Otherwise fetch, cache and return the network copy
  /// 3. If the fetch fails and tier B holds an expired copy, serve it offline
  pub async fn fetch_entity<E, F, Fut>(&self, id: &str, fetcher: F) -> OpResult<CacheResult<E>>
  where
    E: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = OpResult<E>>,
  {
    let key = CacheKey::entity(E::entity_type(), id);

    if let Some((value, cached_at)) = self.lookup(&key) {
      if let Ok(entity) = serde_json::from_value::<E>(value) {
        return Ok(CacheResult::from_cache(entity, cached_at, false));
      }
    }

    let expired = self.durable_entry(&key).filter(|e| e.version == self.version);

    match fetcher().await {
      Ok(entity) => {
        self.cache_entity(&entity)?;
        Ok(CacheResult::from_network(entity))
      }
      Err(e) => match expired.and_then(|entry| {
        serde_json::from_value::<E>(entry.value)
          .ok()
          .map(|entity| (entity, entry.cached_at))
      }) {
        Some((entity, cached_at)) => {
          warn!(key = %key, "fetch failed, serving expired copy: {}", e);
          Ok(CacheResult::offline(entity, cached_at))
        }
        None => Err(e),
      },
    }
  }

  /// Tear down the session: clear tier A, purge tier B, notify subscribers.
  pub fn logout(&self) -> Result<()> {
    self.tier_a.clear();
    self.tier_b.purge()?;
    info!("cache cleared for logout");
    Ok(())
  }

  // ==========================================================================
  // Internals
  // ==========================================================================

  fn lookup(&self, key: &CacheKey) -> Option<(Value, DateTime<Utc>)> {
    if let Some(hit) = self.tier_a.get(key) {
      return Some(hit);
    }

    let entry = self.durable_entry(key)?;
    if entry.is_stale(Utc::now(), self.version) {
      return None;
    }

    let expires_at = entry.cached_at + entry.ttl;
    self
      .tier_a
      .insert(key.clone(), entry.value.clone(), entry.cached_at, Some(expires_at));
    Some((entry.value, entry.cached_at))
  }

  fn durable_entry(&self, key: &CacheKey) -> Option<CacheEntry<Value>> {
    match self.tier_b.get(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, "durable cache read failed: {:#}", e);
        None
      }
    }
  }

  /// Canonical key plus every key recorded for it in either tier.
  fn recorded_keys(&self, canonical: &CacheKey) -> BTreeSet<CacheKey> {
    let mut keys = BTreeSet::from([canonical.clone()]);
    if let Some(recorded) = self.tier_a.key_set(canonical) {
      keys.extend(recorded);
    }
    match self.tier_b.key_set(canonical) {
      Ok(Some(recorded)) => keys.extend(recorded),
      Ok(None) => {}
      Err(e) => warn!(key = %canonical, "durable key set read failed: {:#}", e),
    }
    keys
  }
}

/// Apply an RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Value, patch: &Value) {
  let Value::Object(patch) = patch else {
    *target = patch.clone();
    return;
  };
  if !target.is_object() {
    *target = Value::Object(serde_json::Map::new());
  }
  if let Value::Object(map) = target {
    for (name, value) in patch {
      if value.is_null() {
        map.remove(name);
      } else {
        merge_patch(map.entry(name.clone()).or_insert(Value::Null), value);
      }
    }
  }
}
