//! Cancellable one-shot timer used to schedule retries.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Pending {
  ticket: u64,
  due_at: Instant,
  handle: JoinHandle<()>,
}

/// Schedules at most one pending wake-up at a time.
///
/// A wake-up is observed exactly once: by `poll_due` or `wait_due`. Once
/// cancelled or replaced, a timer that still fires is ignored.
pub struct RetryScheduler {
  next_ticket: u64,
  pending: Option<Pending>,
  tx: mpsc::UnboundedSender<u64>,
  rx: mpsc::UnboundedReceiver<u64>,
}

impl Default for RetryScheduler {
  fn default() -> Self {
    Self::new()
  }
}

impl RetryScheduler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      next_ticket: 0,
      pending: None,
      tx,
      rx,
    }
  }

  /// Schedule a wake-up after `delay`, replacing any pending one.
  pub fn schedule(&mut self, delay: Duration) -> u64 {
    self.cancel();
    self.next_ticket += 1;
    let ticket = self.next_ticket;
    let tx = self.tx.clone();
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = tx.send(ticket);
    });
    self.pending = Some(Pending {
      ticket,
      due_at: Instant::now() + delay,
      handle,
    });
    ticket
  }

  /// Cancel the pending wake-up. Returns `true` if one was pending.
  pub fn cancel(&mut self) -> bool {
    match self.pending.take() {
      Some(pending) => {
        pending.handle.abort();
        true
      }
      None => false,
    }
  }

  pub fn is_pending(&self) -> bool {
    self.pending.is_some()
  }

  pub fn due_at(&self) -> Option<Instant> {
    self.pending.as_ref().map(|p| p.due_at)
  }

  /// Consume a fired wake-up without blocking. Returns `true` if the pending
  /// wake-up fired.
  pub fn poll_due(&mut self) -> bool {
    let mut due = false;
    while let Ok(ticket) = self.rx.try_recv() {
      due |= self.take_if_current(ticket);
    }
    due
  }

  /// Wait for the pending wake-up. Returns `false` if nothing is pending.
  pub async fn wait_due(&mut self) -> bool {
    while self.pending.is_some() {
      match self.rx.recv().await {
        Some(ticket) => {
          if self.take_if_current(ticket) {
            return true;
          }
        }
        None => return false,
      }
    }
    false
  }

  fn take_if_current(&mut self, ticket: u64) -> bool {
    if self.pending.as_ref().map(|p| p.ticket) == Some(ticket) {
      self.pending = None;
      true
    } else {
      false
    }
  }
}

impl Drop for RetryScheduler {
  fn drop(&mut self) {
    self.cancel();
  }
}
