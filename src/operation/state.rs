//! Visible state of an operation.

use serde::Serialize;

use crate::error::EnhancedError;

/// Coarse lifecycle of an operation, for views that only need to branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
  Idle,
  Loading,
  Success,
  Error,
}

/// The state of an operation.
///
/// Data only exists in `Success` and an error only in `Error`, so a view can
/// never observe both at once.
#[derive(Debug, Clone)]
pub enum OperationState<T> {
  /// Operation has not been started, or was reset
  Idle,
  /// A call is in flight
  Loading,
  /// The most recent call completed successfully
  Success(T),
  /// The most recent call failed
  Error(EnhancedError),
}

impl<T> OperationState<T> {
  pub fn status(&self) -> OperationStatus {
    match self {
      Self::Idle => OperationStatus::Idle,
      Self::Loading => OperationStatus::Loading,
      Self::Success(_) => OperationStatus::Success,
      Self::Error(_) => OperationStatus::Error,
    }
  }

  pub fn is_loading(&self) -> bool {
    matches!(self, Self::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, Self::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, Self::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      Self::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&EnhancedError> {
    match self {
      Self::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Progress reported by a running operation.
///
/// A determinate update carries `percent`; an indeterminate one sets
/// `indeterminate` and leaves `percent` empty. Views render the two
/// differently.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressInfo {
  pub percent: Option<f32>,
  pub indeterminate: bool,
  pub message: Option<String>,
}

impl ProgressInfo {
  /// Determinate progress, clamped to 0..=100.
  pub fn percent(percent: f32) -> Self {
    Self {
      percent: Some(percent.clamp(0.0, 100.0)),
      indeterminate: false,
      message: None,
    }
  }

  pub fn indeterminate() -> Self {
    Self {
      percent: None,
      indeterminate: true,
      message: None,
    }
  }

  pub fn with_message(mut self, message: impl Into<String>) -> Self {
    self.message = Some(message.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ErrorContext, ErrorKind};

  #[test]
  fn test_percent_is_clamped() {
    assert_eq!(ProgressInfo::percent(140.0).percent, Some(100.0));
    assert_eq!(ProgressInfo::percent(-3.0).percent, Some(0.0));
  }

  #[test]
  fn test_indeterminate_has_no_percent() {
    let progress = ProgressInfo::indeterminate().with_message("syncing");
    assert!(progress.indeterminate);
    assert_eq!(progress.percent, None);
    assert_eq!(progress.message.as_deref(), Some("syncing"));
  }

  #[test]
  fn test_state_accessors() {
    let state: OperationState<u8> = OperationState::Success(3);
    assert_eq!(state.status(), OperationStatus::Success);
    assert_eq!(state.data(), Some(&3));
    assert!(state.error().is_none());
    assert!(state.is_success() && !state.is_error());

    let failed: OperationState<u8> = OperationState::Error(EnhancedError::new(
      ErrorKind::NotFound,
      "no such user",
      ErrorContext::new("user", "load"),
    ));
    assert!(failed.is_error());
    assert!(!failed.is_loading());
    assert_eq!(failed.status(), OperationStatus::Error);
    assert!(failed.data().is_none());
    assert_eq!(failed.error().map(|e| e.code()), Some("NOT_FOUND"));
  }
}
