//! Error taxonomy shared by every operation.
//!
//! Operation functions and repositories return [`RawError`] for anything that
//! can go wrong. The controller boundary turns those into [`EnhancedError`]s via
//! [`crate::classify::classify`], which is the only shape a view ever sees.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Result returned by operation functions, repositories and use-cases.
///
/// Expected failures are values: callers match on `Ok`/`Err` and never rely on
/// panics for control flow.
pub type OpResult<T> = Result<T, RawError>;

/// Closed set of error kinds a view can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
  #[serde(rename = "VALIDATION_ERROR")]
  Validation,
  #[serde(rename = "NOT_FOUND")]
  NotFound,
  #[serde(rename = "SERVER_ERROR")]
  Server,
  #[serde(rename = "NETWORK_ERROR")]
  Network,
  #[serde(rename = "TIMEOUT_ERROR")]
  Timeout,
  #[serde(rename = "API_ERROR")]
  Api,
  #[serde(rename = "UNKNOWN")]
  Unknown,
}

impl ErrorKind {
  /// Stable wire code for this kind.
  pub fn code(self) -> &'static str {
    match self {
      Self::Validation => "VALIDATION_ERROR",
      Self::NotFound => "NOT_FOUND",
      Self::Server => "SERVER_ERROR",
      Self::Network => "NETWORK_ERROR",
      Self::Timeout => "TIMEOUT_ERROR",
      Self::Api => "API_ERROR",
      Self::Unknown => "UNKNOWN",
    }
  }

  /// Whether a failure of this kind is worth retrying unless told otherwise.
  pub fn default_retryable(self) -> bool {
    matches!(
      self,
      Self::Network | Self::Timeout | Self::Server | Self::Api
    )
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.code())
  }
}

/// An unclassified failure as produced by an operation function.
#[derive(Debug, thiserror::Error)]
pub enum RawError {
  /// The remote store answered with a non-success status
  #[error("HTTP {status}: {message}")]
  Status { status: u16, message: String },
  /// The request never produced a usable response
  #[error(transparent)]
  Transport(#[from] reqwest::Error),
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// Free-form failure, classified by its message shape
  #[error("{0}")]
  Message(String),
  /// An error chain from infrastructure code
  #[error("{0:#}")]
  Report(color_eyre::Report),
  /// The operation function panicked
  #[error("operation panicked: {0}")]
  Panic(String),
}

impl RawError {
  pub fn status(status: u16, message: impl Into<String>) -> Self {
    Self::Status {
      status,
      message: message.into(),
    }
  }

  /// HTTP status behind the failure, if any.
  pub fn status_code(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      Self::Transport(e) => e.status().map(|s| s.as_u16()),
      _ => None,
    }
  }
}

impl From<color_eyre::Report> for RawError {
  fn from(report: color_eyre::Report) -> Self {
    Self::Report(report)
  }
}

impl From<String> for RawError {
  fn from(message: String) -> Self {
    Self::Message(message)
  }
}

impl From<&str> for RawError {
  fn from(message: &str) -> Self {
    Self::Message(message.to_string())
  }
}

/// Where a failure happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
  /// Feature area, e.g. "user" or "team"
  pub domain: String,
  /// Operation name within the domain, e.g. "rename"
  pub operation: String,
  pub details: BTreeMap<String, String>,
  /// When the failure was classified
  pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
  pub fn new(domain: impl Into<String>, operation: impl Into<String>) -> Self {
    Self {
      domain: domain.into(),
      operation: operation.into(),
      details: BTreeMap::new(),
      timestamp: Utc::now(),
    }
  }

  pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.details.insert(key.into(), value.into());
    self
  }
}

/// Classified error envelope surfaced to views.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EnhancedError {
  pub kind: ErrorKind,
  pub message: String,
  /// Whether the view should offer a retry action
  pub retryable: bool,
  pub context: ErrorContext,
  /// The failure this error was classified from, if any
  pub original: Option<Arc<RawError>>,
}

impl EnhancedError {
  pub fn new(kind: ErrorKind, message: impl Into<String>, context: ErrorContext) -> Self {
    Self {
      kind,
      message: message.into(),
      retryable: kind.default_retryable(),
      context,
      original: None,
    }
  }

  /// Wire code of the error kind.
  pub fn code(&self) -> &'static str {
    self.kind.code()
  }

  pub fn with_original(mut self, original: RawError) -> Self {
    self.original = Some(Arc::new(original));
    self
  }

  pub fn with_retryable(mut self, retryable: bool) -> Self {
    self.retryable = retryable;
    self
  }
}
