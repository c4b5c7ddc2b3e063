use crate::event::{Event, EventHandler};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stride::cache::{CacheEvent, CacheResult, CacheSync};
use stride::error::{EnhancedError, ErrorContext, RawError};
use stride::model::User;
use stride::operation::{
  MutationCoordinator, Operation, OperationState, OptimisticOperation, ProgressInfo,
  ProgressReporter, RetryPolicy, RetryableOperation,
};
use stride::remote::{InMemoryRepository, Repository};
use tokio::time::Instant;
use tracing::{debug, info};

const TICK_RATE: Duration = Duration::from_millis(50);

/// An operation the tick loop can drive to completion
trait Tracked {
  fn poll(&mut self) -> bool;
  /// Nothing in flight and no retry pending
  fn is_settled(&self) -> bool;
  fn describe(&self) -> String;
}

impl<P, T> Tracked for Operation<P, T>
where
  P: Send + 'static,
  T: Send + 'static,
{
  fn poll(&mut self) -> bool {
    Operation::poll(self)
  }

  fn is_settled(&self) -> bool {
    !self.is_loading()
  }

  fn describe(&self) -> String {
    describe_state(self.state(), self.progress(), 0)
  }
}

impl<P, T> Tracked for RetryableOperation<P, T>
where
  P: Clone + Send + 'static,
  T: Send + 'static,
{
  fn poll(&mut self) -> bool {
    RetryableOperation::poll(self)
  }

  fn is_settled(&self) -> bool {
    !self.is_loading() && self.next_retry_at().is_none()
  }

  fn describe(&self) -> String {
    match self.state() {
      OperationState::Error(error) => match self.next_retry_at() {
        Some(at) => format!(
          "{}; retry {} in {}ms",
          failure_line(error),
          self.attempt() + 1,
          at.saturating_duration_since(Instant::now()).as_millis()
        ),
        None => failure_line(error),
      },
      state => describe_state(state, self.progress(), self.attempt()),
    }
  }
}

impl<P, E> Tracked for OptimisticOperation<P, E>
where
  P: Send + 'static,
  E: stride::cache::Cacheable + 'static,
{
  fn poll(&mut self) -> bool {
    OptimisticOperation::poll(self)
  }

  fn is_settled(&self) -> bool {
    !self.is_loading()
  }

  fn describe(&self) -> String {
    match self.state() {
      OperationState::Error(error) => format!("{}; change rolled back", failure_line(error)),
      state => describe_state(state, self.progress(), 0),
    }
  }
}

fn describe_state<T>(
  state: &OperationState<T>,
  progress: Option<&ProgressInfo>,
  attempt: u32,
) -> String {
  match state {
    OperationState::Idle => "idle".to_string(),
    OperationState::Loading => {
      let message = progress
        .and_then(|p| p.message.clone())
        .unwrap_or_else(|| "working".to_string());
      if attempt > 0 {
        format!("{} (retry {})", message, attempt)
      } else {
        message
      }
    }
    OperationState::Success(_) => "done".to_string(),
    OperationState::Error(error) => failure_line(error),
  }
}

fn failure_line(error: &EnhancedError) -> String {
  format!("failed [{}]: {}", error.code(), error.message)
}

/// Command driver: binds user commands to operation controllers and pumps
/// them from a tick loop
pub struct App<R> {
  cache: Arc<CacheSync>,
  coordinator: Arc<MutationCoordinator>,
  users: Arc<R>,
  policy: RetryPolicy,
  tick_rate: Duration,
  /// Print cache notifications for entity keys
  show_cache_events: bool,
  /// Echo status lines to stdout
  echo: bool,
  transcript: Vec<String>,
}

impl<R: Repository<User> + 'static> App<R> {
  pub fn new(cache: Arc<CacheSync>, users: Arc<R>, policy: RetryPolicy) -> Self {
    let coordinator = MutationCoordinator::new(Arc::clone(&cache));
    Self {
      cache,
      coordinator,
      users,
      policy,
      tick_rate: TICK_RATE,
      show_cache_events: false,
      echo: true,
      transcript: Vec::new(),
    }
  }

  pub fn with_cache_events(mut self) -> Self {
    self.show_cache_events = true;
    self
  }

  /// Record status lines without printing them
  pub fn quiet(mut self) -> Self {
    self.echo = false;
    self
  }

  pub fn transcript(&self) -> &[String] {
    &self.transcript
  }

  pub fn cache(&self) -> &Arc<CacheSync> {
    &self.cache
  }

  /// Load a user through the cache, retrying transient failures.
  pub async fn get_user(&mut self, id: &str) -> Result<CacheResult<User>> {
    let cache = Arc::clone(&self.cache);
    let users = Arc::clone(&self.users);

    let mut op = RetryableOperation::new(
      ErrorContext::new("user", "get").with_detail("id", id),
      self.policy.clone(),
      move |id: String, progress: ProgressReporter| {
        let cache = Arc::clone(&cache);
        let users = Arc::clone(&users);
        async move {
          let message = format!("loading user {}", id);
          progress.report(ProgressInfo::indeterminate().with_message(message));
          cache
            .fetch_entity::<User, _, _>(&id, || users.find_by_id(&id))
            .await
        }
      },
    );

    op.execute(id.to_string());
    self.drive(&mut op).await?;

    match op.state() {
      OperationState::Success(result) => {
        let result = result.clone();
        self.emit(format!("user {} from {:?}", id, result.source));
        Ok(result)
      }
      OperationState::Error(error) => Err(report(error)),
      _ => Err(eyre!("Loading user {} did not complete", id)),
    }
  }

  /// Rename a user optimistically. The new name is visible in the cache
  /// until the server rejects it.
  pub async fn rename_user(&mut self, id: &str, name: &str) -> Result<User> {
    if self.cache.entity::<User>(id).is_none() {
      self.get_user(id).await?;
    }

    let users = Arc::clone(&self.users);
    let mut op = OptimisticOperation::new(
      ErrorContext::new("user", "rename").with_detail("id", id),
      Arc::clone(&self.coordinator),
      |(id, name): &(String, String)| (id.clone(), json!({ "name": name })),
      move |(id, name): (String, String), progress: ProgressReporter| {
        let users = Arc::clone(&users);
        async move {
          progress.report(ProgressInfo::indeterminate().with_message("saving"));
          users.update(&id, &json!({ "name": name })).await
        }
      },
    );

    op.execute((id.to_string(), name.to_string()))
      .map_err(|e| report(&e))?;
    if let Some(shown) = self.cache.entity::<User>(id) {
      self.emit(format!("user {} shown as {:?} while saving", id, shown.name));
    }

    self.drive(&mut op).await?;

    match op.state() {
      OperationState::Success(user) => Ok(user.clone()),
      OperationState::Error(error) => Err(report(error)),
      _ => Err(eyre!("Renaming user {} did not complete", id)),
    }
  }

  /// Start loading `first`, then switch to `second` before it answers.
  /// Only the second load may become visible.
  pub async fn switch_user(&mut self, first: &str, second: &str, slow: Duration) -> Result<User> {
    let users = Arc::clone(&self.users);
    let mut op = Operation::new(
      ErrorContext::new("user", "switch"),
      move |(id, delay): (String, Duration), _| {
        let users = Arc::clone(&users);
        async move {
          tokio::time::sleep(delay).await;
          users.find_by_id(&id).await
        }
      },
    );

    op.execute((first.to_string(), slow));
    op.execute((second.to_string(), Duration::ZERO));
    self.drive(&mut op).await?;

    // Let the superseded call answer
    tokio::time::sleep(slow * 2).await;
    if !op.poll() {
      self.emit(format!("  late answer for {} discarded", first));
    }

    match op.state() {
      OperationState::Success(user) => Ok(user.clone()),
      OperationState::Error(error) => Err(report(error)),
      _ => Err(eyre!("Switching to user {} did not complete", second)),
    }
  }

  pub fn invalidate(&mut self, entity_type: &str, id: &str) -> usize {
    let count = self.cache.invalidate_entity(entity_type, id);
    self.emit(format!("invalidated {} keys for {}/{}", count, entity_type, id));
    count
  }

  /// Drop every cached entity, as on logout.
  pub fn purge(&mut self) -> Result<()> {
    self.cache.logout()?;
    self.emit("cache purged".to_string());
    Ok(())
  }

  async fn drive<O: Tracked>(&mut self, op: &mut O) -> Result<()> {
    let mut events = EventHandler::new(self.tick_rate, self.cache.subscribe());
    let mut last = String::new();

    loop {
      op.poll();
      let line = op.describe();
      if line != last {
        self.emit(format!("  {}", line));
        last = line;
      }
      if op.is_settled() {
        return Ok(());
      }

      match events.next().await {
        Some(Event::Tick) => {}
        Some(Event::Cache(event)) => self.on_cache_event(event),
        Some(Event::Interrupt) | None => return Err(eyre!("Interrupted")),
      }
    }
  }

  fn on_cache_event(&mut self, event: CacheEvent) {
    debug!(?event, "cache event");
    if !self.show_cache_events {
      return;
    }
    let line = match event {
      CacheEvent::Updated(key) if key.subresource.is_none() && !key.is_index() => {
        format!("  cache: updated {}", key)
      }
      CacheEvent::Invalidated(key) if key.subresource.is_none() && !key.is_index() => {
        format!("  cache: invalidated {}", key)
      }
      CacheEvent::Cleared => "  cache: cleared".to_string(),
      _ => return,
    };
    self.emit(line);
  }

  fn emit(&mut self, line: String) {
    if self.echo {
      println!("{}", line);
    }
    self.transcript.push(line);
  }
}

fn report(error: &EnhancedError) -> color_eyre::Report {
  eyre!("{} [{}]", error.message, error.code())
}

/// Scripted walkthrough against an in-memory backend: transient failures
/// with backoff, cache hits, an optimistic rename that sticks and one that
/// is rolled back.
pub async fn demo(policy: RetryPolicy) -> Result<App<InMemoryRepository<User>>> {
  demo_with(policy, true).await
}

async fn demo_with(policy: RetryPolicy, echo: bool) -> Result<App<InMemoryRepository<User>>> {
  let users = Arc::new(InMemoryRepository::new().with_latency(Duration::from_millis(120)));
  let mut ana = User::new("u1", "Ana Lima", "ana@example.com");
  ana.points = 1_250;
  users.insert(ana);
  users.insert(User::new("u2", "Bruno Sá", "bruno@example.com"));

  let cache = Arc::new(CacheSync::memory_only());
  let mut app = App::new(cache, Arc::clone(&users), policy).with_cache_events();
  if !echo {
    app = app.quiet();
  }

  app.emit("== load with two transient failures".to_string());
  users.fail_next(RawError::status(503, "service unavailable"));
  users.fail_next(RawError::from("connection reset by peer"));
  app.get_user("u1").await?;

  app.emit("== load again".to_string());
  app.get_user("u1").await?;

  app.emit("== switch users while a load is in flight".to_string());
  let shown = app.switch_user("u1", "u2", Duration::from_millis(400)).await?;
  app.emit(format!("showing {}", shown.name));

  app.emit("== rename accepted by the server".to_string());
  app.rename_user("u1", "Ana L.").await?;

  app.emit("== rename rejected by the server".to_string());
  users.fail_next(RawError::status(409, "name already taken"));
  if let Err(e) = app.rename_user("u1", "Bea").await {
    app.emit(format!("rename failed: {}", e));
  }
  if let Some(user) = app.cache().entity::<User>("u1") {
    app.emit(format!("user u1 is {:?} after rollback", user.name));
  }

  app.emit("== load a missing user".to_string());
  if let Err(e) = app.get_user("u404").await {
    app.emit(format!("load failed: {}", e));
  }

  app.emit("== invalidate and purge".to_string());
  app.invalidate("user", "u1");
  app.purge()?;

  info!(calls = users.calls(), "demo finished");
  Ok(app)
}
