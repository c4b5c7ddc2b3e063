//! Retry with exponential backoff on top of [`Operation`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::controller::{Operation, ProgressReporter};
use super::scheduler::RetryScheduler;
use super::state::{OperationState, OperationStatus, ProgressInfo};
use crate::config::RetryConfig;
use crate::error::{EnhancedError, ErrorContext, OpResult};

type RetryPredicate = Arc<dyn Fn(&EnhancedError) -> bool + Send + Sync>;

/// Backoff and attempt ceiling for retryable failures.
///
/// Only errors flagged `retryable` are ever retried automatically; the
/// predicate can narrow that further.
#[derive(Clone)]
pub struct RetryPolicy {
  /// Maximum number of automatic retries per logical call
  pub max_retries: u32,
  /// Delay before the first retry
  pub delay: Duration,
  pub backoff_factor: f64,
  /// Cap for the computed delay
  pub max_delay: Duration,
  predicate: RetryPredicate,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      delay: Duration::from_millis(1000),
      backoff_factor: 1.5,
      max_delay: Duration::from_millis(10_000),
      predicate: Arc::new(|_| true),
    }
  }
}

impl RetryPolicy {
  pub fn from_config(config: &RetryConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      delay: Duration::from_millis(config.delay_ms),
      backoff_factor: config.backoff_factor,
      max_delay: Duration::from_millis(config.max_delay_ms),
      ..Self::default()
    }
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
    self.backoff_factor = backoff_factor;
    self
  }

  pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
    self.max_delay = max_delay;
    self
  }

  /// Restrict automatic retries to errors accepted by `predicate`.
  pub fn with_predicate<F>(mut self, predicate: F) -> Self
  where
    F: Fn(&EnhancedError) -> bool + Send + Sync + 'static,
  {
    self.predicate = Arc::new(predicate);
    self
  }

  /// Delay before retry number `attempt` (1-based).
  ///
  /// `min(delay * backoff_factor^(attempt - 1), max_delay)`
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = self.delay.as_secs_f64() * self.backoff_factor.powi(exponent);
    let max = self.max_delay.as_secs_f64();
    if secs.is_finite() && secs < max {
      Duration::from_secs_f64(secs.max(0.0))
    } else {
      self.max_delay
    }
  }

  /// Whether a failure after `attempts_made` retries earns another one.
  pub fn should_retry(&self, error: &EnhancedError, attempts_made: u32) -> bool {
    error.retryable && attempts_made < self.max_retries && (self.predicate)(error)
  }
}

impl fmt::Debug for RetryPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryPolicy")
      .field("max_retries", &self.max_retries)
      .field("delay", &self.delay)
      .field("backoff_factor", &self.backoff_factor)
      .field("max_delay", &self.max_delay)
      .finish_non_exhaustive()
  }
}

/// An [`Operation`] that re-executes retryable failures on a backoff schedule.
///
/// While a retry is pending the visible state stays `Error`, so a view can
/// show the failure together with `next_retry_at`.
pub struct RetryableOperation<P, T> {
  inner: Operation<P, T>,
  policy: RetryPolicy,
  scheduler: RetryScheduler,
  /// Retries issued for the current logical call
  attempt: u32,
  last_params: Option<P>,
  /// Settled call token already checked against the policy
  evaluated: Option<u64>,
}

impl<P, T> RetryableOperation<P, T>
where
  P: Clone + Send + 'static,
  T: Send + 'static,
{
  pub fn new<F, Fut>(context: ErrorContext, policy: RetryPolicy, op: F) -> Self
  where
    F: Fn(P, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OpResult<T>> + Send + 'static,
  {
    Self {
      inner: Operation::new(context, op),
      policy,
      scheduler: RetryScheduler::new(),
      attempt: 0,
      last_params: None,
      evaluated: None,
    }
  }

  pub fn state(&self) -> &OperationState<T> {
    self.inner.state()
  }

  pub fn status(&self) -> OperationStatus {
    self.inner.status()
  }

  pub fn data(&self) -> Option<&T> {
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

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  /// Retries issued for the current logical call.
  pub fn attempt(&self) -> u32 {
    self.attempt
  }

  /// When the pending automatic retry will run, if one is scheduled.
  pub fn next_retry_at(&self) -> Option<Instant> {
    self.scheduler.due_at()
  }

  /// Start a new logical call. Cancels any pending retry and resets the
  /// attempt count.
  pub fn execute(&mut self, params: P) -> u64 {
    self.scheduler.cancel();
    self.attempt = 0;
    self.evaluated = None;
    self.last_params = Some(params.clone());
    self.inner.execute(params)
  }

  /// Force one more attempt with the last params, outside the automatic
  /// schedule. Returns `false` if there is nothing to retry.
  pub fn retry(&mut self) -> bool {
    let Some(params) = self.last_params.clone() else {
      return false;
    };
    self.scheduler.cancel();
    self.attempt += 1;
    debug!(
      domain = %self.inner.context().domain,
      operation = %self.inner.context().operation,
      attempt = self.attempt,
      "manual retry"
    );
    self.inner.execute(params);
    true
  }

  /// Return to idle and drop any pending retry.
  pub fn reset(&mut self) {
    self.scheduler.cancel();
    self.attempt = 0;
    self.evaluated = None;
    self.last_params = None;
    self.inner.reset();
  }

  /// Apply outcomes and fire due retries. Returns `true` if visible state
  /// changed.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.inner.poll();
    self.evaluate();
    if self.scheduler.poll_due() {
      self.fire();
      changed = true;
    }
    changed
  }

  /// Wait until the current logical call settles, including every automatic
  /// retry it earns.
  pub async fn settle(&mut self) -> &OperationState<T> {
    loop {
      self.inner.settle().await;
      self.evaluate();
      if !self.scheduler.wait_due().await {
        break;
      }
      self.fire();
    }
    self.inner.state()
  }

  fn evaluate(&mut self) {
    let Some(token) = self.inner.settled_token() else {
      return;
    };
    if self.evaluated == Some(token) {
      return;
    }
    self.evaluated = Some(token);

    let Some(error) = self.inner.error() else {
      return;
    };
    if !self.policy.should_retry(error, self.attempt) {
      return;
    }

    let next = self.attempt + 1;
    let delay = self.policy.delay_for_attempt(next);
    info!(
      domain = %error.context.domain,
      operation = %error.context.operation,
      code = error.code(),
      attempt = next,
      delay_ms = delay.as_millis() as u64,
      "scheduling retry"
    );
    self.scheduler.schedule(delay);
  }

  fn fire(&mut self) {
    if let Some(params) = self.last_params.clone() {
      self.attempt += 1;
      self.inner.execute(params);
    }
  }
}

impl<P, T: fmt::Debug> fmt::Debug for RetryableOperation<P, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryableOperation")
      .field("inner", &self.inner)
      .field("policy", &self.policy)
      .field("attempt", &self.attempt)
      .finish_non_exhaustive()
  }
}
