//! Process-local reactive tier.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::key::{CacheKey, KeyPrefix};
use super::traits::CacheEvent;

/// Capacity of the change-event channel; slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 256;

struct Slot {
  value: Value,
  stale: bool,
  written_at: DateTime<Utc>,
  /// Past this instant the slot reads as a miss
  expires_at: Option<DateTime<Utc>>,
  /// Canonical key of the entity whose write produced this slot
  owner: Option<CacheKey>,
}

impl Slot {
  fn is_fresh(&self, now: DateTime<Utc>) -> bool {
    !self.stale && self.expires_at.map_or(true, |at| now <= at)
  }

  /// Whether invalidating `canonical` may touch this slot.
  fn owned_by(&self, canonical: &CacheKey) -> bool {
    self.owner.as_ref().map_or(true, |owner| owner == canonical)
  }
}

#[derive(Default)]
struct Slots {
  entries: HashMap<CacheKey, Slot>,
  /// Keys written by the last `write_entity` for each canonical key
  key_sets: HashMap<CacheKey, Vec<CacheKey>>,
}

/// In-memory tier that notifies subscribers on every change.
///
/// Reads of stale or expired slots miss, so the next reader refetches.
pub struct ReactiveTier {
  slots: Mutex<Slots>,
  events: broadcast::Sender<CacheEvent>,
}

impl Default for ReactiveTier {
  fn default() -> Self {
    Self::new()
  }
}

impl ReactiveTier {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      slots: Mutex::new(Slots::default()),
      events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  /// Fresh value and when it was written.
  pub fn get(&self, key: &CacheKey) -> Option<(Value, DateTime<Utc>)> {
    let now = Utc::now();
    let slots = self.lock();
    slots
      .entries
      .get(key)
      .filter(|slot| slot.is_fresh(now))
      .map(|slot| (slot.value.clone(), slot.written_at))
  }

  /// Write a key that never expires.
  pub fn set(&self, key: CacheKey, value: Value) {
    self.insert(key, value, Utc::now(), None);
  }

  /// Write a key with an explicit write time and expiry.
  pub fn insert(
    &self,
    key: CacheKey,
    value: Value,
    written_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
  ) {
    self.lock().entries.insert(
      key.clone(),
      Slot {
        value,
        stale: false,
        written_at,
        expires_at,
        owner: None,
      },
    );
    self.notify(CacheEvent::Updated(key));
  }

  /// Write every key of one entity and record its key set, under one lock.
  ///
  /// The entity becomes the owner of every slot it writes.
  pub fn write_entity(
    &self,
    canonical: &CacheKey,
    entries: &[(CacheKey, Value)],
    expires_at: Option<DateTime<Utc>>,
  ) {
    let now = Utc::now();
    {
      let mut slots = self.lock();
      for (key, value) in entries {
        slots.entries.insert(
          key.clone(),
          Slot {
            value: value.clone(),
            stale: false,
            written_at: now,
            expires_at,
            owner: Some(canonical.clone()),
          },
        );
      }
      slots.key_sets.insert(
        canonical.clone(),
        entries.iter().map(|(key, _)| key.clone()).collect(),
      );
    }
    for (key, _) in entries {
      self.notify(CacheEvent::Updated(key.clone()));
    }
  }

  pub fn key_set(&self, canonical: &CacheKey) -> Option<Vec<CacheKey>> {
    self.lock().key_sets.get(canonical).cloned()
  }

  /// Mark a key stale. Returns `true` if it held a fresh value.
  pub fn invalidate(&self, key: &CacheKey) -> bool {
    let changed = match self.lock().entries.get_mut(key) {
      Some(slot) if !slot.stale => {
        slot.stale = true;
        true
      }
      _ => false,
    };
    if changed {
      self.notify(CacheEvent::Invalidated(key.clone()));
    }
    changed
  }

  /// Invalidate keys of an entity, skipping slots another entity wrote
  /// since. The key set is forgotten when `keys` holds the canonical key.
  pub fn invalidate_entity(&self, canonical: &CacheKey, keys: &[CacheKey]) -> usize {
    let invalidated: Vec<CacheKey> = {
      let mut slots = self.lock();
      if keys.contains(canonical) {
        slots.key_sets.remove(canonical);
      }
      keys
        .iter()
        .filter(|key| match slots.entries.get_mut(*key) {
          Some(slot) if !slot.stale && slot.owned_by(canonical) => {
            slot.stale = true;
            true
          }
          _ => false,
        })
        .cloned()
        .collect()
    };
    for key in &invalidated {
      self.notify(CacheEvent::Invalidated(key.clone()));
    }
    invalidated.len()
  }

  pub fn invalidate_many(&self, prefix: &KeyPrefix) -> usize {
    let keys: Vec<CacheKey> = {
      let mut slots = self.lock();
      slots
        .entries
        .iter_mut()
        .filter(|(key, slot)| !slot.stale && key.matches(prefix))
        .map(|(key, slot)| {
          slot.stale = true;
          key.clone()
        })
        .collect()
    };
    for key in &keys {
      self.notify(CacheEvent::Invalidated(key.clone()));
    }
    keys.len()
  }

  pub fn clear(&self) {
    {
      let mut slots = self.lock();
      slots.entries.clear();
      slots.key_sets.clear();
    }
    self.notify(CacheEvent::Cleared);
  }

  /// Number of fresh slots.
  pub fn len(&self) -> usize {
    let now = Utc::now();
    self.lock().entries.values().filter(|slot| slot.is_fresh(now)).count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn notify(&self, event: CacheEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  fn lock(&self) -> MutexGuard<'_, Slots> {
    // Slots stay consistent across a panic; every update is a single insert
    self.slots.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_invalidated_slot_misses() {
    let tier = ReactiveTier::new();
    let key = CacheKey::entity("team", "t1");
    tier.set(key.clone(), json!({"name": "Closers"}));
    assert!(tier.get(&key).is_some());

    assert!(tier.invalidate(&key));
    assert!(!tier.invalidate(&key));
    assert!(tier.get(&key).is_none());
  }

  #[test]
  fn test_invalidate_many_by_prefix() {
    let tier = ReactiveTier::new();
    tier.set(CacheKey::entity("team", "t1"), json!(1));
    tier.set(CacheKey::sub_view("team", "t1", "members"), json!([]));
    tier.set(CacheKey::entity("team", "t2"), json!(2));

    assert_eq!(tier.invalidate_many(&KeyPrefix::entity("team", "t1")), 2);
    assert_eq!(tier.len(), 1);
    assert_eq!(tier.invalidate_many(&KeyPrefix::entity_type("team")), 1);
    assert!(tier.is_empty());
  }

  #[test]
  fn test_expired_slot_misses() {
    let tier = ReactiveTier::new();
    let now = Utc::now();
    let old = CacheKey::entity("team", "t1");
    let live = CacheKey::entity("team", "t2");

    let minutes = chrono::Duration::minutes;

    tier.insert(old.clone(), json!(1), now - minutes(10), Some(now - minutes(5)));
    tier.insert(live.clone(), json!(2), now, Some(now + minutes(5)));

    assert!(tier.get(&old).is_none());
    assert_eq!(tier.get(&live).map(|(value, _)| value), Some(json!(2)));
    assert_eq!(tier.len(), 1);
  }

  #[test]
  fn test_entity_invalidation_skips_slots_of_other_owners() {
    let tier = ReactiveTier::new();
    let u1 = CacheKey::entity("user", "u1");
    let u2 = CacheKey::entity("user", "u2");
    let email = CacheKey::index("user", "email", "shared@example.com");

    let first = json!({"id": "u1"});
    let second = json!({"id": "u2"});

    tier.write_entity(&u1, &[(u1.clone(), first.clone()), (email.clone(), first)], None);
    tier.write_entity(&u2, &[(u2.clone(), second.clone()), (email.clone(), second)], None);

    assert_eq!(tier.invalidate_entity(&u1, &[u1.clone(), email.clone()]), 1);
    assert!(tier.key_set(&u1).is_none());
    assert_eq!(tier.get(&email).map(|(value, _)| value["id"].clone()), Some(json!("u2")));

    // Without the canonical key the key set survives
    assert_eq!(tier.invalidate_entity(&u2, &[email.clone()]), 1);
    assert!(tier.key_set(&u2).is_some());
  }

  #[tokio::test]
  async fn test_changes_are_published() {
    let tier = ReactiveTier::new();
    let mut events = tier.subscribe();
    let key = CacheKey::entity("team", "t1");

    tier.set(key.clone(), json!(1));
    tier.invalidate(&key);
    tier.clear();

    assert_eq!(events.recv().await.unwrap(), CacheEvent::Updated(key.clone()));
    assert_eq!(events.recv().await.unwrap(), CacheEvent::Invalidated(key));
    assert_eq!(events.recv().await.unwrap(), CacheEvent::Cleared);
  }
}
