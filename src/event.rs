use std::time::Duration;
use stride::cache::CacheEvent;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// Periodic tick for operation polling
  Tick,
  /// A cache key changed
  Cache(CacheEvent),
  /// Ctrl-C
  Interrupt,
}

/// Merges the tick timer, cache notifications and Ctrl-C into one stream
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
  tasks: Vec<JoinHandle<()>>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration, mut cache_events: broadcast::Receiver<CacheEvent>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    let ticker = tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    let cache_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
      loop {
        match cache_events.recv().await {
          Ok(event) => {
            if cache_tx.send(Event::Cache(event)).is_err() {
              break;
            }
          }
          // Missed notifications are not replayed
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    let interrupt = tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Interrupt);
      }
    });

    Self {
      rx,
      tasks: vec![ticker, forwarder, interrupt],
    }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Drop for EventHandler {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}
