//! Hierarchical cache keys shared by both tiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Separator between entity type and index name in index keys.
const INDEX_SEPARATOR: char = '@';

/// Address of an entity, one of its sub-views, or a secondary-index entry.
///
/// - canonical: `("user", "u1", None)`
/// - sub-view: `("user", "u1", Some("profile"))`
/// - secondary index: `("user@email", "ana@example.com", None)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
  pub entity_type: String,
  pub id: String,
  pub subresource: Option<String>,
}

impl CacheKey {
  /// Canonical key of an entity.
  pub fn entity(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      entity_type: entity_type.into(),
      id: id.into(),
      subresource: None,
    }
  }

  /// Key of a sub-view (e.g. "profile") of an entity.
  pub fn sub_view(
    entity_type: impl Into<String>,
    id: impl Into<String>,
    name: impl Into<String>,
  ) -> Self {
    Self {
      entity_type: entity_type.into(),
      id: id.into(),
      subresource: Some(name.into()),
    }
  }

  /// Key of a secondary-index entry (e.g. lookup by email).
  pub fn index(entity_type: &str, index: &str, value: impl Into<String>) -> Self {
    Self {
      entity_type: format!("{}{}{}", entity_type, INDEX_SEPARATOR, index),
      id: value.into(),
      subresource: None,
    }
  }

  /// Entity type without any index suffix.
  pub fn base_type(&self) -> &str {
    self
      .entity_type
      .split_once(INDEX_SEPARATOR)
      .map(|(base, _)| base)
      .unwrap_or(&self.entity_type)
  }

  pub fn is_index(&self) -> bool {
    self.entity_type.contains(INDEX_SEPARATOR)
  }

  pub fn matches(&self, prefix: &KeyPrefix) -> bool {
    if self.base_type() != prefix.entity_type {
      return false;
    }
    match &prefix.id {
      Some(id) => !self.is_index() && &self.id == id,
      None => true,
    }
  }

  /// Fixed-length digest used to address the key in durable storage.
  pub fn storage_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.entity_type.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(self.id.as_bytes());
    if let Some(sub) = &self.subresource {
      hasher.update(b"\x1f");
      hasher.update(sub.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.entity_type, self.id)?;
    if let Some(sub) = &self.subresource {
      write!(f, "/{}", sub)?;
    }
    Ok(())
  }
}

/// Leading segments of a [`CacheKey`], for bulk invalidation.
///
/// A type-only prefix also covers that type's secondary-index keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPrefix {
  pub entity_type: String,
  pub id: Option<String>,
}

impl KeyPrefix {
  /// Every key of an entity type.
  pub fn entity_type(entity_type: impl Into<String>) -> Self {
    Self {
      entity_type: entity_type.into(),
      id: None,
    }
  }

  /// The canonical key and all sub-views of one entity.
  pub fn entity(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      entity_type: entity_type.into(),
      id: Some(id.into()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_display() {
    assert_eq!(CacheKey::entity("user", "u1").to_string(), "user/u1");
    assert_eq!(
      CacheKey::sub_view("user", "u1", "profile").to_string(),
      "user/u1/profile"
    );
    assert_eq!(
      CacheKey::index("user", "email", "ana@example.com").to_string(),
      "user@email/ana@example.com"
    );
  }

  #[test]
  fn test_prefix_matching() {
    let canonical = CacheKey::entity("user", "u1");
    let profile = CacheKey::sub_view("user", "u1", "profile");
    let email = CacheKey::index("user", "email", "u1");
    let other = CacheKey::entity("team", "u1");

    let by_entity = KeyPrefix::entity("user", "u1");
    assert!(canonical.matches(&by_entity));
    assert!(profile.matches(&by_entity));
    assert!(!email.matches(&by_entity));
    assert!(!other.matches(&by_entity));

    let by_type = KeyPrefix::entity_type("user");
    assert!(email.matches(&by_type));
    assert!(!other.matches(&by_type));
  }

  #[test]
  fn test_storage_hash_distinguishes_segments() {
    let a = CacheKey::sub_view("user", "u1", "x");
    let b = CacheKey::entity("user", "u1x");
    assert_ne!(a.storage_hash(), b.storage_hash());
    assert_eq!(a.storage_hash().len(), 64);
    assert_eq!(a.storage_hash(), a.clone().storage_hash());
  }
}
