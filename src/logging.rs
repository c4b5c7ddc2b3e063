use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter directive variable, e.g. `STRIDE_LOG=stride=debug`.
pub const LOG_ENV: &str = "STRIDE_LOG";

/// Directory for the rolling log files.
pub fn log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("stride").join("logs"))
}

/// Install the global subscriber.
///
/// Logs go to a daily rolling file under [`log_dir`]; with `verbose` they are
/// mirrored to stderr. Keep the returned guard alive until exit or buffered
/// lines are lost.
pub fn init(verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = || EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_dir() {
    Some(dir) => {
      std::fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "stride.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter());
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  let stderr_layer = verbose.then(|| {
    tracing_subscriber::fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .with_filter(filter())
  });

  tracing_subscriber::registry()
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
