use color_eyre::{eyre::eyre, Result};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::Repository;
use crate::cache::Cacheable;
use crate::config::{RemoteConfig, REMOTE_URL_ENV};
use crate::error::{OpResult, RawError};

/// REST client for one entity collection.
///
/// Entities live at `{base}/{entity_type}s/{id}`. Non-2xx responses become
/// [`RawError::Status`] carrying the server's message.
pub struct HttpRepository<E> {
  client: reqwest::Client,
  base: Url,
  _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for HttpRepository<E> {
  fn clone(&self) -> Self {
    Self {
      client: self.client.clone(),
      base: self.base.clone(),
      _entity: PhantomData,
    }
  }
}

impl<E: Cacheable> HttpRepository<E> {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let url = config.url.as_deref().ok_or_else(|| {
      eyre!(
        "No remote URL configured. Set remote.url in the config file or {}.",
        REMOTE_URL_ENV
      )
    })?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.timeout_ms))
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Self::with_client(client, url)
  }

  pub fn with_client(client: reqwest::Client, base: &str) -> Result<Self> {
    let mut base = Url::parse(base).map_err(|e| eyre!("Invalid remote URL {}: {}", base, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("Remote URL {} cannot be a base", base));
    }
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    Ok(Self {
      client,
      base,
      _entity: PhantomData,
    })
  }

  pub fn entity_url(&self, id: &str) -> Url {
    let mut url = self.base.clone();
    // Base is checked in the constructor
    if let Ok(mut segments) = url.path_segments_mut() {
      segments
        .pop_if_empty()
        .push(&format!("{}s", E::entity_type()))
        .push(id);
    }
    url
  }

  async fn send(&self, request: RequestBuilder) -> OpResult<Response> {
    let response = request.send().await?;
    let status = response.status();
    debug!(url = %response.url(), status = status.as_u16(), "remote response");

    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RawError::status(status.as_u16(), error_message(status, &body)))
  }
}

impl<E: Cacheable> Repository<E> for HttpRepository<E> {
  async fn find_by_id(&self, id: &str) -> OpResult<E> {
    let response = self.send(self.client.get(self.entity_url(id))).await?;
    Ok(response.json::<E>().await?)
  }

  async fn save(&self, entity: &E) -> OpResult<E> {
    let request = self
      .client
      .put(self.entity_url(&entity.cache_id()))
      .json(entity);
    let response = self.send(request).await?;
    Ok(response.json::<E>().await?)
  }

  async fn update(&self, id: &str, patch: &Value) -> OpResult<E> {
    let request = self
      .client
      .patch(self.entity_url(id))
      .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
      .body(patch.to_string());
    let response = self.send(request).await?;
    Ok(response.json::<E>().await?)
  }

  async fn delete(&self, id: &str) -> OpResult<()> {
    self.send(self.client.delete(self.entity_url(id))).await?;
    Ok(())
  }
}

/// Best human-readable message from an error response body.
fn error_message(status: StatusCode, body: &str) -> String {
  let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
    ["message", "error", "detail"]
      .iter()
      .find_map(|field| v.get(field).and_then(Value::as_str).map(str::to_string))
  });

  from_json.unwrap_or_else(|| {
    let body = body.trim();
    if body.is_empty() {
      status
        .canonical_reason()
        .unwrap_or("Request failed")
        .to_string()
    } else {
      body.to_string()
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Team, User};

  #[test]
  fn test_entity_url() {
    let repo: HttpRepository<User> =
      HttpRepository::with_client(reqwest::Client::new(), "https://api.example.com/v1").unwrap();
    assert_eq!(
      repo.entity_url("u1").as_str(),
      "https://api.example.com/v1/users/u1"
    );

    let repo: HttpRepository<Team> =
      HttpRepository::with_client(reqwest::Client::new(), "https://api.example.com/").unwrap();
    assert_eq!(
      repo.entity_url("a/b").as_str(),
      "https://api.example.com/teams/a%2Fb"
    );
  }

  #[test]
  fn test_rejects_bad_base() {
    assert!(HttpRepository::<User>::with_client(reqwest::Client::new(), "nope").is_err());
    assert!(HttpRepository::<User>::new(&RemoteConfig::default()).is_err());
  }

  #[test]
  fn test_error_message() {
    assert_eq!(
      error_message(StatusCode::UNPROCESSABLE_ENTITY, r#"{"message":"name is required"}"#),
      "name is required"
    );
    assert_eq!(
      error_message(StatusCode::BAD_GATEWAY, "upstream down\n"),
      "upstream down"
    );
    assert_eq!(error_message(StatusCode::NOT_FOUND, ""), "Not Found");
  }
}
