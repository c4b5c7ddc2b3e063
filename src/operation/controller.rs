//! Operation controller: one async unit of work bound to one view.
//!
//! Inspired by TanStack Query. An [`Operation`] owns the operation function,
//! spawns each call onto the runtime and applies the outcome when the view
//! polls it from its event loop tick.
//!
//! # Example
//!
//! ```ignore
//! let repo = repo.clone();
//! let mut load = Operation::new(ErrorContext::new("user", "load"), move |id: String, _progress| {
//!     let repo = repo.clone();
//!     async move { repo.find_by_id(&id).await }
//! });
//!
//! load.execute("u1".to_string());
//!
//! // In event loop tick
//! if load.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match load.state() {
//!     OperationState::Loading => render_spinner(load.progress()),
//!     OperationState::Success(user) => render_user(user),
//!     OperationState::Error(e) if e.retryable => render_error_with_retry(e),
//!     OperationState::Error(e) => render_error(e),
//!     OperationState::Idle => {}
//! }
//! ```

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use super::state::{OperationState, OperationStatus, ProgressInfo};
use crate::classify::classify;
use crate::error::{EnhancedError, ErrorContext, OpResult, RawError};

/// A boxed future that returns an `OpResult<T>`
type BoxFuture<T> = Pin<Box<dyn Future<Output = OpResult<T>> + Send>>;

/// The operation function, shared with every spawned call
type OperationFn<P, T> = Arc<dyn Fn(P, ProgressReporter) -> BoxFuture<T> + Send + Sync>;

/// Outcome of one call, tagged with the call token it belongs to
struct Settlement<T> {
  token: u64,
  result: Result<T, EnhancedError>,
}

/// Handle an operation function uses to report progress.
///
/// Updates from a superseded call are dropped by the controller.
#[derive(Clone)]
pub struct ProgressReporter {
  token: u64,
  tx: mpsc::UnboundedSender<(u64, ProgressInfo)>,
}

impl ProgressReporter {
  pub fn report(&self, progress: ProgressInfo) {
    // Receiver gone means the controller was dropped
    let _ = self.tx.send((self.token, progress));
  }
}

/// Stateful wrapper around one async unit of work.
///
/// Each `execute` gets a new call token; only the outcome of the most recent
/// token is allowed to change visible state.
pub struct Operation<P, T> {
  state: OperationState<T>,
  progress: Option<ProgressInfo>,
  op: OperationFn<P, T>,
  context: ErrorContext,
  token: u64,
  settled_token: Option<u64>,
  tx: mpsc::UnboundedSender<Settlement<T>>,
  rx: mpsc::UnboundedReceiver<Settlement<T>>,
  progress_tx: mpsc::UnboundedSender<(u64, ProgressInfo)>,
  progress_rx: mpsc::UnboundedReceiver<(u64, ProgressInfo)>,
}

impl<P, T> Operation<P, T>
where
  P: Send + 'static,
  T: Send + 'static,
{
  /// Create a new operation with a fixed error context.
  ///
  /// The operation function is called once per `execute`. It must not touch
  /// shared state directly; visible changes go through the cache.
  pub fn new<F, Fut>(context: ErrorContext, op: F) -> Self
  where
    F: Fn(P, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OpResult<T>> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let op: OperationFn<P, T> =
      Arc::new(move |params: P, reporter: ProgressReporter| -> BoxFuture<T> {
        Box::pin(op(params, reporter))
      });
    Self {
      state: OperationState::Idle,
      progress: None,
      op,
      context,
      token: 0,
      settled_token: None,
      tx,
      rx,
      progress_tx,
      progress_rx,
    }
  }

  pub fn state(&self) -> &OperationState<T> {
    &self.state
  }

  pub fn status(&self) -> OperationStatus {
    self.state.status()
  }

  /// Get the data if the most recent call succeeded.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  /// Get the error if the most recent call failed.
  pub fn error(&self) -> Option<&EnhancedError> {
    self.state.error()
  }

  /// Latest progress of the in-flight call.
  pub fn progress(&self) -> Option<&ProgressInfo> {
    self.progress.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn context(&self) -> &ErrorContext {
    &self.context
  }

  /// Token of the most recently issued call.
  pub fn token(&self) -> u64 {
    self.token
  }

  /// Token of the call whose outcome is currently visible, if any.
  pub(crate) fn settled_token(&self) -> Option<u64> {
    self.settled_token
  }

  /// Start a call, superseding any call still in flight.
  ///
  /// Returns the call token.
  pub fn execute(&mut self, params: P) -> u64 {
    self.token += 1;
    let token = self.token;
    self.state = OperationState::Loading;
    self.progress = None;
    self.settled_token = None;

    let op = Arc::clone(&self.op);
    let context = self.context.clone();
    let tx = self.tx.clone();
    let reporter = ProgressReporter {
      token,
      tx: self.progress_tx.clone(),
    };

    tokio::spawn(async move {
      let outcome = AssertUnwindSafe(async move { op(params, reporter).await })
        .catch_unwind()
        .await;
      let result = match outcome {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(raw)) => Err(classify(raw, &context)),
        Err(payload) => Err(classify(RawError::Panic(panic_message(payload)), &context)),
      };
      // Ignore send errors - the controller may have been dropped
      let _ = tx.send(Settlement { token, result });
    });

    token
  }

  /// Apply pending progress updates and outcomes without blocking.
  ///
  /// Returns `true` if visible state changed. Call this in your event loop
  /// tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.drain_progress();
    while let Ok(settlement) = self.rx.try_recv() {
      changed |= self.apply(settlement);
    }
    // Progress sent just before the outcome may land after it
    changed |= self.drain_progress();
    changed
  }

  /// Wait until the current call settles and return the resulting state.
  ///
  /// Returns immediately when nothing is in flight.
  pub async fn settle(&mut self) -> &OperationState<T> {
    self.poll();
    while self.state.is_loading() {
      match self.rx.recv().await {
        Some(settlement) => {
          self.apply(settlement);
        }
        // Unreachable while we hold a sender
        None => break,
      }
    }
    self.drain_progress();
    &self.state
  }

  /// Return to idle, dropping data, error, progress and any in-flight call.
  pub fn reset(&mut self) {
    self.token += 1;
    self.state = OperationState::Idle;
    self.progress = None;
    self.settled_token = None;
  }

  fn apply(&mut self, settlement: Settlement<T>) -> bool {
    if settlement.token != self.token || !self.state.is_loading() {
      trace!(
        domain = %self.context.domain,
        operation = %self.context.operation,
        token = settlement.token,
        current = self.token,
        "discarding superseded response"
      );
      return false;
    }

    self.state = match settlement.result {
      Ok(data) => OperationState::Success(data),
      Err(error) => OperationState::Error(error),
    };
    self.progress = None;
    self.settled_token = Some(settlement.token);
    true
  }

  fn drain_progress(&mut self) -> bool {
    let mut changed = false;
    while let Ok((token, progress)) = self.progress_rx.try_recv() {
      if token == self.token && self.state.is_loading() {
        self.progress = Some(progress);
        changed = true;
      }
    }
    changed
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

// Operation is not Clone because it owns the receiving ends of its channels.

impl<P, T: std::fmt::Debug> std::fmt::Debug for Operation<P, T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Operation")
      .field("state", &self.state)
      .field("progress", &self.progress)
      .field("context", &self.context)
      .field("token", &self.token)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use std::time::Duration;

  fn ctx() -> ErrorContext {
    ErrorContext::new("test", "op")
  }

  #[tokio::test]
  async fn test_operation_success() {
    let mut op = Operation::new(ctx(), |n: u32, _| async move { Ok(vec![n; 3]) });

    assert_eq!(op.status(), OperationStatus::Idle);

    op.execute(1);
    assert!(op.is_loading());

    op.settle().await;
    assert_eq!(op.status(), OperationStatus::Success);
    assert_eq!(op.data(), Some(&vec![1, 1, 1]));
    assert!(op.error().is_none());
  }

  #[tokio::test]
  async fn test_operation_error_keeps_original() {
    let mut op: Operation<(), u32> =
      Operation::new(ctx(), |_, _| async { Err(RawError::status(404, "no such team")) });

    op.execute(());
    op.settle().await;

    let error = op.error().expect("error state");
    assert_eq!(op.status(), OperationStatus::Error);
    assert!(op.data().is_none());
    assert_eq!(error.kind, ErrorKind::NotFound);
    assert!(!error.retryable);
    assert!(matches!(
      error.original.as_deref(),
      Some(RawError::Status { status: 404, .. })
    ));
  }

  #[tokio::test]
  async fn test_panic_is_caught_and_classified() {
    let mut op: Operation<(), u32> = Operation::new(ctx(), |_, _| async {
      let fail = true;
      if fail {
        panic!("boom");
      }
      Ok(0)
    });

    op.execute(());
    op.settle().await;

    let error = op.error().expect("error state");
    assert_eq!(error.kind, ErrorKind::Unknown);
    assert!(matches!(error.original.as_deref(), Some(RawError::Panic(m)) if m == "boom"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_response_is_discarded() {
    let mut op = Operation::new(ctx(), |(value, delay_ms): (&'static str, u64), _| async move {
      tokio::time::sleep(Duration::from_millis(delay_ms)).await;
      Ok(value)
    });

    op.execute(("a", 100));
    op.execute(("b", 10));

    op.settle().await;
    assert_eq!(op.data(), Some(&"b"));

    // Let the first call finish after the second one
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!op.poll());
    assert_eq!(op.data(), Some(&"b"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_progress_reported_while_loading() {
    let mut op = Operation::new(ctx(), |_: (), progress: ProgressReporter| async move {
      progress.report(ProgressInfo::percent(50.0).with_message("halfway"));
      tokio::time::sleep(Duration::from_millis(100)).await;
      Ok(1)
    });

    op.execute(());
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(op.poll());
    assert_eq!(op.progress().and_then(|p| p.percent), Some(50.0));

    op.settle().await;
    assert!(op.progress().is_none());
    assert_eq!(op.data(), Some(&1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_reset_is_idempotent_and_drops_in_flight() {
    let mut op = Operation::new(ctx(), |_: (), _| async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(42)
    });

    op.execute(());
    op.reset();
    op.reset();

    assert_eq!(op.status(), OperationStatus::Idle);
    assert!(op.data().is_none() && op.error().is_none() && op.progress().is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!op.poll());
    assert_eq!(op.status(), OperationStatus::Idle);
  }

  #[tokio::test]
  async fn test_settle_without_call_returns_idle() {
    let mut op = Operation::new(ctx(), |_: (), _| async { Ok(0) });
    assert!(matches!(op.settle().await, OperationState::Idle));
  }
}
