mod app;
mod event;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use stride::cache::CacheSync;
use stride::config::Config;
use stride::logging;
use stride::model::User;
use stride::operation::RetryPolicy;
use stride::remote::HttpRepository;

#[derive(Parser, Debug)]
#[command(name = "stride")]
#[command(about = "Cached, retrying access to the Stride sales API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stride/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read or change users
  User {
    #[command(subcommand)]
    command: UserCommand,
  },
  /// Inspect or clear the local cache
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
  /// Walk through retries and optimistic updates against an in-memory backend
  Demo,
}

#[derive(Subcommand, Debug)]
enum UserCommand {
  /// Load a user, from the cache when fresh
  Get { id: String },
  /// Rename a user optimistically
  Rename { id: String, name: String },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Drop every cached key of one entity
  Invalidate { entity_type: String, id: String },
  /// Drop the whole cache, as on logout
  Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let policy = RetryPolicy::from_config(&config.retry);

  match args.command {
    Command::Demo => {
      app::demo(policy).await?;
    }
    Command::User { command } => {
      let cache = Arc::new(CacheSync::from_config(&config.cache)?);
      let users = Arc::new(HttpRepository::<User>::new(&config.remote)?);
      let mut app = app::App::new(cache, users, policy);

      let user = match command {
        UserCommand::Get { id } => app.get_user(&id).await?.data,
        UserCommand::Rename { id, name } => app.rename_user(&id, &name).await?,
      };
      let json = serde_json::to_string_pretty(&user)
        .map_err(|e| eyre!("Failed to serialize user: {}", e))?;
      println!("{}", json);
    }
    Command::Cache { command } => {
      let cache = CacheSync::from_config(&config.cache)?;
      match command {
        CacheCommand::Invalidate { entity_type, id } => {
          cache.invalidate_entity(&entity_type, &id);
          println!("invalidated {}/{}", entity_type, id);
        }
        CacheCommand::Purge => {
          cache.logout()?;
          println!("cache purged");
        }
      }
    }
  }

  Ok(())
}
