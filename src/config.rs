use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `remote.url`.
pub const REMOTE_URL_ENV: &str = "STRIDE_REMOTE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Base URL of the sales API, e.g. "https://api.example.com/v1/"
  pub url: Option<String>,
  /// Per-request timeout
  pub timeout_ms: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_ms: 15_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Disable to keep the cache in memory only
  pub enabled: bool,
  /// SQLite file for the durable tier (defaults to the data directory)
  pub path: Option<PathBuf>,
  /// Lifetime of durable entries
  pub ttl_secs: u64,
  /// Bump to discard entries written by older builds
  pub version: u32,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      ttl_secs: 300,
      version: 1,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub delay_ms: u64,
  pub backoff_factor: f64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      delay_ms: 1_000,
      backoff_factor: 1.5,
      max_delay_ms: 10_000,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stride.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stride/config.yaml
  ///
  /// With no file found the defaults apply. `STRIDE_REMOTE_URL` overrides
  /// the configured remote URL either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(url) = std::env::var(REMOTE_URL_ENV) {
      if !url.trim().is_empty() {
        config.remote.url = Some(url);
      }
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stride.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stride").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is a valid config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    if self.retry.backoff_factor < 1.0 || !self.retry.backoff_factor.is_finite() {
      return Err(eyre!(
        "retry.backoff_factor must be at least 1.0, got {}",
        self.retry.backoff_factor
      ));
    }
    if self.retry.max_delay_ms < self.retry.delay_ms {
      return Err(eyre!(
        "retry.max_delay_ms ({}) must not be below retry.delay_ms ({})",
        self.retry.max_delay_ms,
        self.retry.delay_ms
      ));
    }
    if let Some(url) = &self.remote.url {
      url::Url::parse(url).map_err(|e| eyre!("remote.url is invalid: {}", e))?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_for_missing_sections() {
    let config = Config::parse("remote:\n  url: https://api.example.com/v1/\n").unwrap();
    assert_eq!(config.remote.url.as_deref(), Some("https://api.example.com/v1/"));
    assert_eq!(config.remote.timeout_ms, 15_000);
    assert!(config.cache.enabled);
    assert_eq!(config.cache.ttl_secs, 300);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.backoff_factor, 1.5);
  }

  #[test]
  fn test_empty_file() {
    let config = Config::parse("  \n").unwrap();
    assert!(config.remote.url.is_none());
    assert_eq!(config.retry.delay_ms, 1_000);
  }

  #[test]
  fn test_partial_section() {
    let config = Config::parse("retry:\n  max_retries: 5\ncache:\n  enabled: false\n").unwrap();
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.max_delay_ms, 10_000);
    assert!(!config.cache.enabled);
    assert_eq!(config.cache.version, 1);
  }

  #[test]
  fn test_validation() {
    let mut config = Config::default();
    assert!(config.validate().is_ok());

    config.retry.backoff_factor = 0.5;
    assert!(config.validate().is_err());

    config.retry.backoff_factor = 2.0;
    config.remote.url = Some("not a url".to_string());
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stride.yaml");
    std::fs::write(&path, "cache:\n  ttl_secs: 60\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.cache.ttl_secs, 60);

    let missing = dir.path().join("missing.yaml");
    assert!(Config::load(Some(&missing)).is_err());
  }
}
