//! Remote data sources for cached entities.

mod client;
mod memory;

pub use client::HttpRepository;
pub use memory::InMemoryRepository;

use serde_json::Value;
use std::future::Future;

use crate::cache::Cacheable;
use crate::error::OpResult;

/// Remote CRUD for one entity type.
///
/// Failures are raw; callers classify them through an operation controller.
pub trait Repository<E: Cacheable>: Send + Sync {
  fn find_by_id(&self, id: &str) -> impl Future<Output = OpResult<E>> + Send;

  /// Replace the entity and return the server's copy.
  fn save(&self, entity: &E) -> impl Future<Output = OpResult<E>> + Send;

  /// Apply a JSON merge patch and return the server's copy.
  fn update(&self, id: &str, patch: &Value) -> impl Future<Output = OpResult<E>> + Send;

  fn delete(&self, id: &str) -> impl Future<Output = OpResult<()>> + Send;
}
