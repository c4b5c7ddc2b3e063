//! Optimistic mutations: speculative cache writes with snapshot rollback.
//!
//! Every mutation pushes a layer onto a per-key chain. A layer remembers the
//! value it replaced; the chain is resolved LIFO so that a failing mutation
//! never clobbers a later mutation that is still in flight.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::controller::{Operation, ProgressReporter};
use super::state::{OperationState, OperationStatus, ProgressInfo};
use crate::cache::{merge_patch, CacheKey, CacheSync, Cacheable};
use crate::classify::classify;
use crate::error::{EnhancedError, ErrorContext, OpResult};

/// The value an optimistic write replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticSnapshot<T> {
  /// `None` when the entity was not cached
  pub previous_value: Option<T>,
  pub applied_at: DateTime<Utc>,
}

struct Layer {
  id: u64,
  snapshot: OptimisticSnapshot<Value>,
  speculative: Value,
  /// A later mutation on the same key was confirmed; this one must not
  /// overwrite it on resolution
  shadowed: bool,
}

enum Resolution<'a, E> {
  Commit(Option<&'a E>),
  Rollback,
}

/// Owns the per-key snapshot chains for one session cache.
pub struct MutationCoordinator {
  cache: Arc<CacheSync>,
  chains: Mutex<HashMap<CacheKey, Vec<Layer>>>,
  next_id: AtomicU64,
}

impl MutationCoordinator {
  pub fn new(cache: Arc<CacheSync>) -> Arc<Self> {
    Arc::new(Self {
      cache,
      chains: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
    })
  }

  pub fn cache(&self) -> &Arc<CacheSync> {
    &self.cache
  }

  /// Number of unresolved mutations on an entity.
  pub fn pending<E: Cacheable>(&self, id: &str) -> usize {
    let key = CacheKey::entity(E::entity_type(), id);
    self.lock().get(&key).map_or(0, Vec::len)
  }

  /// Merge `patch` into the entity, write the result to the cache and
  /// snapshot what it replaced.
  ///
  /// If the entity is not cached the patch must describe a whole entity.
  pub fn begin<E: Cacheable>(
    self: &Arc<Self>,
    id: &str,
    patch: &Value,
  ) -> Result<PendingMutation<E>> {
    let key = CacheKey::entity(E::entity_type(), id);
    let mut chains = self.lock();

    // Stacked on a pending mutation, the base is that mutation's value
    let previous = match chains.get(&key).and_then(|chain| chain.last()) {
      Some(top) => Some(top.speculative.clone()),
      None => self.cache.get_value(&key),
    };

    let mut merged = previous.clone().unwrap_or_else(|| Value::Object(Map::new()));
    merge_patch(&mut merged, patch);
    let entity: E = serde_json::from_value(merged)
      .map_err(|e| eyre!("Speculative value for {} is invalid: {}", key, e))?;
    if entity.cache_id() != id {
      return Err(eyre!("Speculative value for {} is invalid: id changed", key));
    }
    let speculative = serde_json::to_value(&entity)
      .map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;

    self.cache.cache_entity(&entity)?;

    let snapshot = OptimisticSnapshot {
      previous_value: previous,
      applied_at: Utc::now(),
    };
    let layer_id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let chain = chains.entry(key.clone()).or_default();
    chain.push(Layer {
      id: layer_id,
      snapshot: snapshot.clone(),
      speculative,
      shadowed: false,
    });
    debug!(key = %key, depth = chain.len(), "applied optimistic value");

    Ok(PendingMutation {
      coordinator: Arc::clone(self),
      key,
      layer_id,
      snapshot,
      resolved: false,
      _entity: PhantomData,
    })
  }

  fn resolve<E: Cacheable>(&self, key: &CacheKey, layer_id: u64, resolution: Resolution<'_, E>) {
    let mut chains = self.lock();
    let Some(chain) = chains.get_mut(key) else {
      return;
    };
    let Some(pos) = chain.iter().position(|layer| layer.id == layer_id) else {
      return;
    };
    let layer = chain.remove(pos);
    let was_top = pos == chain.len();

    match resolution {
      Resolution::Rollback if was_top => {
        info!(key = %key, "rolling back optimistic value");
        self.restore::<E>(key, layer.snapshot.previous_value);
      }
      Resolution::Rollback => {
        // The mutation above now sits directly on this one's base
        chain[pos].snapshot.previous_value = layer.snapshot.previous_value;
      }
      // A later confirmed mutation already set the base of every layer around
      // this one to its newer value
      Resolution::Commit(_) if layer.shadowed => {}
      Resolution::Commit(server) => {
        let confirmed = match server {
          Some(entity) if was_top => {
            if let Err(e) = self.cache.cache_entity(entity) {
              warn!(key = %key, "failed to reconcile with server value: {:#}", e);
            }
            serde_json::to_value(entity).unwrap_or(layer.speculative)
          }
          Some(entity) => serde_json::to_value(entity).unwrap_or(layer.speculative),
          None => layer.speculative,
        };
        if !was_top {
          chain[pos].snapshot.previous_value = Some(confirmed.clone());
        }
        // Earlier mutations must not undo a confirmed later one
        for below in &mut chain[..pos] {
          below.snapshot.previous_value = Some(confirmed.clone());
          below.shadowed = true;
        }
      }
    }

    if chain.is_empty() {
      chains.remove(key);
    }
  }

  /// Snapshot of a layer as the chain holds it now.
  fn snapshot_of(&self, key: &CacheKey, layer_id: u64) -> Option<OptimisticSnapshot<Value>> {
    let chains = self.lock();
    chains
      .get(key)?
      .iter()
      .find(|layer| layer.id == layer_id)
      .map(|layer| layer.snapshot.clone())
  }

  fn restore<E: Cacheable>(&self, key: &CacheKey, previous: Option<Value>) {
    let Some(value) = previous else {
      self.cache.invalidate_entity(&key.entity_type, &key.id);
      return;
    };
    let restored = serde_json::from_value::<E>(value)
      .map_err(|e| eyre!("Snapshot of {} no longer deserializes: {}", key, e))
      .and_then(|entity| self.cache.cache_entity(&entity));
    if let Err(e) = restored {
      warn!(key = %key, "rollback failed, invalidating instead: {:#}", e);
      self.cache.invalidate_entity(&key.entity_type, &key.id);
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Vec<Layer>>> {
    self.chains.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// An applied, unresolved optimistic write.
///
/// Dropping it unresolved rolls it back, so a panicking or cancelled
/// mutation cannot leave its speculative value behind.
pub struct PendingMutation<E: Cacheable> {
  coordinator: Arc<MutationCoordinator>,
  key: CacheKey,
  layer_id: u64,
  snapshot: OptimisticSnapshot<Value>,
  resolved: bool,
  _entity: PhantomData<fn() -> E>,
}

impl<E: Cacheable> PendingMutation<E> {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// What a rollback would restore right now.
  ///
  /// Resolving a mutation lower on the same key hands its base up, so this
  /// can differ from the value seen when the mutation began.
  pub fn snapshot(&self) -> OptimisticSnapshot<Value> {
    self
      .coordinator
      .snapshot_of(&self.key, self.layer_id)
      .unwrap_or_else(|| self.snapshot.clone())
  }

  /// Confirm the mutation. With a server value the cache is reconciled to it.
  pub fn commit(mut self, server: Option<&E>) {
    self.resolved = true;
    self
      .coordinator
      .resolve(&self.key, self.layer_id, Resolution::Commit(server));
  }

  /// Undo the mutation.
  pub fn rollback(mut self) {
    self.resolved = true;
    self
      .coordinator
      .resolve::<E>(&self.key, self.layer_id, Resolution::Rollback);
  }
}

impl<E: Cacheable> Drop for PendingMutation<E> {
  fn drop(&mut self) {
    if !self.resolved {
      self
        .coordinator
        .resolve::<E>(&self.key, self.layer_id, Resolution::Rollback);
    }
  }
}

/// Params of one optimistic call, as handed to the wrapped operation.
struct Staged<P, E: Cacheable> {
  params: P,
  pending: PendingMutation<E>,
  reconcile: bool,
}

type ApplyFn<P> = Arc<dyn Fn(&P) -> (String, Value) + Send + Sync>;

/// An [`Operation`] whose calls write a speculative value before running.
///
/// The rollback of a failed call happens inside the call, before its outcome
/// reaches the controller, so a view never sees the error next to the
/// speculative value.
pub struct OptimisticOperation<P, E: Cacheable> {
  inner: Operation<Staged<P, E>, E>,
  coordinator: Arc<MutationCoordinator>,
  apply: ApplyFn<P>,
  reconcile: bool,
}

impl<P, E> OptimisticOperation<P, E>
where
  P: Send + 'static,
  E: Cacheable + 'static,
{
  /// `apply` maps params to the target entity id and a JSON merge patch.
  /// `op` performs the mutation remotely and returns the server's entity.
  pub fn new<A, F, Fut>(
    context: ErrorContext,
    coordinator: Arc<MutationCoordinator>,
    apply: A,
    op: F,
  ) -> Self
  where
    A: Fn(&P) -> (String, Value) + Send + Sync + 'static,
    F: Fn(P, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OpResult<E>> + Send + 'static,
  {
    let op = Arc::new(op);
    let inner = Operation::new(context, move |staged: Staged<P, E>, progress| {
      let op = Arc::clone(&op);
      async move {
        let Staged {
          params,
          pending,
          reconcile,
        } = staged;
        let result = op(params, progress).await;
        match &result {
          Ok(entity) => pending.commit(reconcile.then_some(entity)),
          Err(_) => pending.rollback(),
        }
        result
      }
    });

    Self {
      inner,
      coordinator,
      apply: Arc::new(apply),
      reconcile: true,
    }
  }

  /// Keep the speculative value on success instead of the server's copy.
  pub fn without_reconcile(mut self) -> Self {
    self.reconcile = false;
    self
  }

  pub fn state(&self) -> &OperationState<E> {
    self.inner.state()
  }

  pub fn status(&self) -> OperationStatus {
    self.inner.status()
  }

  pub fn data(&self) -> Option<&E> {
    self.inner.data()
  }

  pub fn error(&self) -> Option<&EnhancedError> {
    self.inner.error()
  }

  pub fn progress(&self) -> Option<&ProgressInfo> {
    self.inner.progress()
  }

  pub fn is_loading(&self) -> bool {
    self.inner.is_loading()
  }

  /// Apply the speculative value and start the call.
  ///
  /// Fails without starting anything if the patch does not produce a valid
  /// entity.
  pub fn execute(&mut self, params: P) -> Result<u64, EnhancedError> {
    let (id, patch) = (self.apply)(&params);
    let pending = self
      .coordinator
      .begin::<E>(&id, &patch)
      .map_err(|e| classify(e.into(), self.inner.context()))?;

    Ok(self.inner.execute(Staged {
      params,
      pending,
      reconcile: self.reconcile,
    }))
  }

  pub fn poll(&mut self) -> bool {
    self.inner.poll()
  }

  pub async fn settle(&mut self) -> &OperationState<E> {
    self.inner.settle().await
  }

  /// Return to idle. In-flight calls still resolve their own snapshots.
  pub fn reset(&mut self) {
    self.inner.reset();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ErrorKind, RawError};
  use crate::model::User;
  use serde_json::json;
  use std::time::Duration;

  fn setup() -> (Arc<CacheSync>, Arc<MutationCoordinator>) {
    let cache = Arc::new(CacheSync::memory_only());
    cache.cache_entity(&User::new("u1", "A", "ana@example.com")).unwrap();
    let coordinator = MutationCoordinator::new(Arc::clone(&cache));
    (cache, coordinator)
  }

  fn name(cache: &CacheSync) -> Option<String> {
    cache.entity::<User>("u1").map(|u| u.name)
  }

  fn previous_name(pending: &PendingMutation<User>) -> Option<Value> {
    pending.snapshot().previous_value.map(|v| v["name"].clone())
  }

  /// Rename `u1` remotely after `delay_ms`; fails with 503 when `fail` is set.
  fn rename_op(
    coordinator: Arc<MutationCoordinator>,
  ) -> OptimisticOperation<(&'static str, u64, bool), User> {
    OptimisticOperation::new(
      ErrorContext::new("user", "rename"),
      coordinator,
      |(name, _, _): &(&'static str, u64, bool)| ("u1".to_string(), json!({ "name": name })),
      |(name, delay_ms, fail): (&'static str, u64, bool), _| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        if fail {
          Err(RawError::status(503, "unavailable"))
        } else {
          Ok(User::new("u1", name, "ana@example.com"))
        }
      },
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_mutation_rolls_back() {
    let (cache, coordinator) = setup();
    let mut rename = rename_op(coordinator);

    rename.execute(("B", 50, true)).unwrap();
    assert_eq!(name(&cache).as_deref(), Some("B"));

    rename.settle().await;
    assert_eq!(rename.error().map(|e| e.kind), Some(ErrorKind::Server));
    assert_eq!(name(&cache).as_deref(), Some("A"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_rollback_precedes_visible_error() {
    let (cache, coordinator) = setup();
    let mut rename = rename_op(coordinator);

    rename.execute(("B", 50, true)).unwrap();
    for _ in 0..20 {
      tokio::time::sleep(Duration::from_millis(5)).await;
      rename.poll();
      if rename.error().is_some() {
        assert_eq!(name(&cache).as_deref(), Some("A"));
      }
    }
    assert!(rename.error().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_reconciles_with_server_value() {
    let (cache, coordinator) = setup();
    let mut rename = OptimisticOperation::new(
      ErrorContext::new("user", "rename"),
      Arc::clone(&coordinator),
      |name: &String| ("u1".to_string(), json!({ "name": name })),
      |name: String, _| async move {
        let mut user = User::new("u1", &name, "ana@example.com");
        user.points = 5;
        Ok(user)
      },
    );

    rename.execute("B".to_string()).unwrap();
    rename.settle().await;

    let cached = cache.entity::<User>("u1").unwrap();
    assert_eq!(cached.name, "B");
    assert_eq!(cached.points, 5);
    assert_eq!(coordinator.pending::<User>("u1"), 0);
  }

  #[tokio::test]
  async fn test_invalid_patch_is_rejected_up_front() {
    let (cache, coordinator) = setup();
    let mut rename: OptimisticOperation<(), User> = OptimisticOperation::new(
      ErrorContext::new("user", "rename"),
      coordinator,
      |_: &()| ("u1".to_string(), json!({ "name": 42 })),
      |_: (), _| async { Err(RawError::from("unreachable")) },
    );

    let error = rename.execute(()).unwrap_err();
    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(rename.status(), OperationStatus::Idle);
    assert_eq!(name(&cache).as_deref(), Some("A"));
  }

  #[test]
  fn test_earlier_failure_keeps_later_pending_value() {
    let (cache, coordinator) = setup();

    let first = coordinator.begin::<User>("u1", &json!({"name": "B"})).unwrap();
    let second = coordinator.begin::<User>("u1", &json!({"name": "C"})).unwrap();
    assert_eq!(previous_name(&second), Some(json!("B")));

    first.rollback();
    assert_eq!(name(&cache).as_deref(), Some("C"));
    assert_eq!(previous_name(&second), Some(json!("A")));

    second.rollback();
    assert_eq!(name(&cache).as_deref(), Some("A"));
  }

  #[test]
  fn test_later_failure_restores_earlier_speculative_value() {
    let (cache, coordinator) = setup();

    let first = coordinator.begin::<User>("u1", &json!({"name": "B"})).unwrap();
    let second = coordinator.begin::<User>("u1", &json!({"name": "C"})).unwrap();

    second.rollback();
    assert_eq!(name(&cache).as_deref(), Some("B"));

    first.rollback();
    assert_eq!(name(&cache).as_deref(), Some("A"));
    assert_eq!(coordinator.pending::<User>("u1"), 0);
  }

  #[test]
  fn test_confirmed_later_mutation_survives_earlier_failure() {
    let (cache, coordinator) = setup();

    let first = coordinator.begin::<User>("u1", &json!({"name": "B"})).unwrap();
    let second = coordinator.begin::<User>("u1", &json!({"name": "C"})).unwrap();

    second.commit(Some(&User::new("u1", "C", "ana@example.com")));
    first.rollback();
    assert_eq!(name(&cache).as_deref(), Some("C"));
  }

  #[test]
  fn test_shadowed_commit_keeps_newer_confirmed_value() {
    let (cache, coordinator) = setup();
    let user = |name: &str| User::new("u1", name, "ana@example.com");

    let first = coordinator.begin::<User>("u1", &json!({"name": "B"})).unwrap();
    let second = coordinator.begin::<User>("u1", &json!({"name": "C"})).unwrap();
    let third = coordinator.begin::<User>("u1", &json!({"name": "D"})).unwrap();

    third.commit(Some(&user("D")));
    second.commit(Some(&user("C")));
    assert_eq!(name(&cache).as_deref(), Some("D"));
    assert_eq!(previous_name(&first), Some(json!("D")));

    first.rollback();
    assert_eq!(name(&cache).as_deref(), Some("D"));
    assert_eq!(coordinator.pending::<User>("u1"), 0);
  }

  #[test]
  fn test_snapshot_follows_base_handed_up() {
    let (_cache, coordinator) = setup();

    let first = coordinator.begin::<User>("u1", &json!({"name": "B"})).unwrap();
    let second = coordinator.begin::<User>("u1", &json!({"name": "C"})).unwrap();

    first.commit(None);
    assert_eq!(previous_name(&second), Some(json!("B")));

    let third = coordinator.begin::<User>("u1", &json!({"name": "D"})).unwrap();
    assert_eq!(previous_name(&third), Some(json!("C")));
    second.rollback();
    assert_eq!(previous_name(&third), Some(json!("B")));
  }

  #[test]
  fn test_dropped_mutation_rolls_back() {
    let (cache, coordinator) = setup();
    {
      let _pending = coordinator.begin::<User>("u1", &json!({"name": "B"})).unwrap();
      assert_eq!(name(&cache).as_deref(), Some("B"));
    }
    assert_eq!(name(&cache).as_deref(), Some("A"));
  }

  #[test]
  fn test_rolled_back_creation_is_removed() {
    let (cache, coordinator) = setup();
    let pending = coordinator
      .begin::<User>("u9", &json!({"id": "u9", "name": "New", "email": "new@example.com"}))
      .unwrap();
    assert!(pending.snapshot().previous_value.is_none());
    assert!(cache.entity::<User>("u9").is_some());

    pending.rollback();
    assert!(cache.entity::<User>("u9").is_none());
    assert!(cache
      .get_value(&CacheKey::index("user", "email", "new@example.com"))
      .is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_overlapping_calls_resolve_in_order() {
    let (cache, coordinator) = setup();
    let mut rename = rename_op(coordinator);

    // First call fails after the second one was confirmed
    rename.execute(("B", 100, true)).unwrap();
    rename.execute(("C", 50, false)).unwrap();
    rename.settle().await;
    assert_eq!(rename.data().map(|u| u.name.as_str()), Some("C"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!rename.poll());
    assert_eq!(rename.status(), OperationStatus::Success);
    assert_eq!(name(&cache).as_deref(), Some("C"));
  }
}
