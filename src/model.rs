//! Entities the client caches.
//!
//! Feature modules own the business rules; these types only carry what the
//! cache needs to address them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::Cacheable;

/// A sales rep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: String,
  pub name: String,
  pub email: String,
  #[serde(default)]
  pub team_id: Option<String>,
  #[serde(default)]
  pub points: i64,
  #[serde(default)]
  pub profile: UserProfile,
  #[serde(default)]
  pub settings: UserSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub display_name: String,
  pub title: Option<String>,
  pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
  pub notifications: bool,
  pub theme: String,
}

impl Default for UserSettings {
  fn default() -> Self {
    Self {
      notifications: true,
      theme: "system".to_string(),
    }
  }
}

impl User {
  pub fn new(id: &str, name: &str, email: &str) -> Self {
    Self {
      id: id.to_string(),
      name: name.to_string(),
      email: email.to_string(),
      team_id: None,
      points: 0,
      profile: UserProfile {
        display_name: name.to_string(),
        ..UserProfile::default()
      },
      settings: UserSettings::default(),
    }
  }
}

impl Cacheable for User {
  fn entity_type() -> &'static str {
    "user"
  }

  fn cache_id(&self) -> String {
    self.id.clone()
  }

  fn sub_views(&self) -> Vec<(&'static str, Value)> {
    vec![
      ("profile", json!(self.profile)),
      ("settings", json!(self.settings)),
    ]
  }

  fn secondary_keys(&self) -> Vec<(&'static str, String)> {
    // Emails are matched case-insensitively
    vec![("email", self.email.to_lowercase())]
  }
}

/// A team competing on the leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub member_ids: Vec<String>,
  #[serde(default)]
  pub score: i64,
}

impl Cacheable for Team {
  fn entity_type() -> &'static str {
    "team"
  }

  fn cache_id(&self) -> String {
    self.id.clone()
  }

  fn sub_views(&self) -> Vec<(&'static str, Value)> {
    vec![("members", json!(self.member_ids))]
  }
}
