use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::Repository;
use crate::cache::{merge_patch, Cacheable};
use crate::error::{OpResult, RawError};

/// Repository backed by a map, with scripted failures and latency.
///
/// Queued failures are consumed one per call, in order, before the call
/// touches the map.
pub struct InMemoryRepository<E> {
  entities: Mutex<HashMap<String, E>>,
  failures: Mutex<VecDeque<RawError>>,
  latency: Duration,
  calls: AtomicUsize,
}

impl<E: Cacheable> Default for InMemoryRepository<E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<E: Cacheable> InMemoryRepository<E> {
  pub fn new() -> Self {
    Self {
      entities: Mutex::new(HashMap::new()),
      failures: Mutex::new(VecDeque::new()),
      latency: Duration::ZERO,
      calls: AtomicUsize::new(0),
    }
  }

  /// Delay every call by `latency`.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn insert(&self, entity: E) {
    self.lock_entities().insert(entity.cache_id(), entity);
  }

  pub fn get(&self, id: &str) -> Option<E> {
    self.lock_entities().get(id).cloned()
  }

  /// Fail the next call with `error`.
  pub fn fail_next(&self, error: RawError) {
    self
      .failures
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push_back(error);
  }

  /// Number of calls made so far, failed ones included.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  async fn begin_call(&self, action: &str, id: &str) -> OpResult<()> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }

    let failure = self
      .failures
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .pop_front();
    debug!(call, action, id, failed = failure.is_some(), "in-memory repository call");

    match failure {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }

  fn not_found(id: &str) -> RawError {
    RawError::status(404, format!("{} {} not found", E::entity_type(), id))
  }

  fn lock_entities(&self) -> MutexGuard<'_, HashMap<String, E>> {
    self.entities.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl<E: Cacheable> Repository<E> for InMemoryRepository<E> {
  async fn find_by_id(&self, id: &str) -> OpResult<E> {
    self.begin_call("find_by_id", id).await?;
    self.get(id).ok_or_else(|| Self::not_found(id))
  }

  async fn save(&self, entity: &E) -> OpResult<E> {
    let id = entity.cache_id();
    self.begin_call("save", &id).await?;
    self.insert(entity.clone());
    Ok(entity.clone())
  }

  async fn update(&self, id: &str, patch: &Value) -> OpResult<E> {
    self.begin_call("update", id).await?;

    let mut entities = self.lock_entities();
    let current = entities.get(id).ok_or_else(|| Self::not_found(id))?;
    let mut value = serde_json::to_value(current)
      .map_err(|e| RawError::Message(format!("failed to serialize {}: {}", id, e)))?;
    merge_patch(&mut value, patch);

    let updated: E = serde_json::from_value(value)
      .map_err(|e| RawError::status(422, format!("invalid update for {}: {}", id, e)))?;
    if updated.cache_id() != id {
      return Err(RawError::status(422, format!("update may not change the id of {}", id)));
    }
    entities.insert(id.to_string(), updated.clone());
    Ok(updated)
  }

  async fn delete(&self, id: &str) -> OpResult<()> {
    self.begin_call("delete", id).await?;
    self
      .lock_entities()
      .remove(id)
      .map(|_| ())
      .ok_or_else(|| Self::not_found(id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::User;
  use serde_json::json;

  fn repo() -> InMemoryRepository<User> {
    let repo = InMemoryRepository::new();
    repo.insert(User::new("u1", "Ana", "ana@example.com"));
    repo
  }

  #[tokio::test]
  async fn test_find_and_missing() {
    let repo = repo();
    assert_eq!(repo.find_by_id("u1").await.unwrap().name, "Ana");

    let missing = repo.find_by_id("u2").await.unwrap_err();
    assert_eq!(missing.status_code(), Some(404));
    assert_eq!(repo.calls(), 2);
  }

  #[tokio::test]
  async fn test_failures_are_consumed_in_order() {
    let repo = repo();
    repo.fail_next(RawError::status(503, "unavailable"));
    repo.fail_next(RawError::from("connection reset"));

    assert_eq!(repo.find_by_id("u1").await.unwrap_err().status_code(), Some(503));
    assert!(matches!(repo.find_by_id("u1").await, Err(RawError::Message(_))));
    assert!(repo.find_by_id("u1").await.is_ok());
  }

  #[tokio::test]
  async fn test_update_merges_patch() {
    let repo = repo();
    let updated = repo.update("u1", &json!({"name": "Bea", "points": 7})).await.unwrap();
    assert_eq!(updated.name, "Bea");
    assert_eq!(updated.points, 7);
    assert_eq!(repo.get("u1").unwrap().email, "ana@example.com");

    let invalid = repo.update("u1", &json!({"points": "many"})).await.unwrap_err();
    assert_eq!(invalid.status_code(), Some(422));
    assert_eq!(repo.get("u1").unwrap().name, "Bea");
  }

  #[tokio::test]
  async fn test_save_and_delete() {
    let repo = InMemoryRepository::<User>::new();
    repo.save(&User::new("u3", "Cy", "cy@example.com")).await.unwrap();
    assert!(repo.get("u3").is_some());

    repo.delete("u3").await.unwrap();
    assert_eq!(repo.delete("u3").await.unwrap_err().status_code(), Some(404));
  }

  #[tokio::test(start_paused = true)]
  async fn test_latency() {
    let repo = repo().with_latency(Duration::from_millis(200));
    let started = tokio::time::Instant::now();
    repo.find_by_id("u1").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
  }
}
