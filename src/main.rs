use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use offcache::cache::{CacheStorage, NoopStorage, SqliteStorage};
use offcache::http::{Request, ReqwestNetwork};
use offcache::notify::Notification;
use offcache::sync::SubmissionStore;
use offcache::{Config, EventOutcome, FetchOutcome, Worker, WorkerEvent};

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Offline request cache with background sync and push relay")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offcache.yaml or $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin to cache for; overrides the config file
  #[arg(short, long, global = true)]
  origin: Option<Url>,

  /// SQLite database path; overrides the config file
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  /// Keep everything in memory for this run only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Disable caching and deferred submissions; every request goes to the network
  #[arg(long, global = true, conflicts_with_all = ["database", "ephemeral"])]
  no_cache: bool,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Open the current partitions and precache the manifest
  Install,
  /// Remove stale partitions and take control
  Activate,
  /// Fetch a URL through the cache and write the body to stdout
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Extra request header, `name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Send a write; queue it for background sync if offline
  Submit {
    method: String,
    url: String,
    #[arg(short, long)]
    body: Option<String>,
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Fire a sync event to replay pending submissions
  Sync {
    #[arg(short, long)]
    tag: Option<String>,
  },
  /// Turn a push payload into a notification
  Push {
    /// Raw payload (JSON or text); omit for an empty push
    #[arg(short, long)]
    payload: Option<String>,
  },
  /// Resolve a click on a notification printed by `push`
  Click {
    /// Notification JSON as printed by `push`
    #[arg(short, long)]
    notification: String,
    #[arg(short, long)]
    action: Option<String>,
  },
  /// List cache partitions and their entry counts
  Partitions,
  /// List pending submissions
  Pending,
  /// Run a local caching proxy in front of the origin
  Serve {
    #[arg(short, long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_file.as_deref())?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref(), args.origin.as_ref())?;
  if let Some(database) = args.database {
    config.cache.database = Some(database);
  }

  if args.no_cache {
    tracing::info!("Caching disabled");
    return run(args.command, &config, Arc::new(NoopStorage)).await;
  }

  let storage = if args.ephemeral {
    SqliteStorage::open_in_memory()?
  } else {
    SqliteStorage::open(config.cache.database.as_deref())?
  };
  run(args.command, &config, Arc::new(storage)).await
}

async fn run<S>(command: Command, config: &Config, storage: Arc<S>) -> Result<()>
where
  S: CacheStorage + SubmissionStore + 'static,
{
  let network = Arc::new(ReqwestNetwork::new(config.network.timeout())?);
  let worker = Worker::new(config, Arc::clone(&storage), network)?;

  match command {
    Command::Install => {
      print_json(&worker.dispatch(WorkerEvent::Install).await?.into_json()?)?;
    }
    Command::Activate => {
      print_json(&worker.dispatch(WorkerEvent::Activate).await?.into_json()?)?;
    }
    Command::Fetch { url, headers } => {
      worker.start().await?;
      let mut request = Request::get(config.resolve(&url)?);
      for header in &headers {
        let (name, value) = parse_header(header)?;
        request = request.with_header(name, value);
      }

      let result = match worker.dispatch(WorkerEvent::Fetch(request)).await? {
        EventOutcome::Fetched(FetchOutcome::Handled { category, result }) => {
          tracing::info!(?category, source = result.source.as_str(), "Fetched");
          result
        }
        EventOutcome::Fetched(FetchOutcome::Passthrough(request)) => worker.respond(request).await?,
        other => return Err(eyre!("Unexpected outcome: {:?}", other)),
      };

      eprintln!(
        "{} ({})",
        result.response.status,
        result.source.as_str()
      );
      std::io::stdout()
        .write_all(&result.response.body)
        .map_err(|e| eyre!("Failed to write body: {}", e))?;
    }
    Command::Submit {
      method,
      url,
      body,
      headers,
    } => {
      worker.start().await?;
      let mut request = Request::new(&method, config.resolve(&url)?);
      for header in &headers {
        let (name, value) = parse_header(header)?;
        request = request.with_header(name, value);
      }
      if let Some(body) = body {
        request = request.with_body(body);
      }

      let result = worker.respond(request).await?;
      eprintln!("{} ({})", result.response.status, result.source.as_str());
      std::io::stdout()
        .write_all(&result.response.body)
        .map_err(|e| eyre!("Failed to write body: {}", e))?;
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      print_json(&worker.dispatch(WorkerEvent::Sync { tag }).await?.into_json()?)?;
    }
    Command::Push { payload } => {
      let event = WorkerEvent::Push {
        payload: payload.map(String::into_bytes),
      };
      print_json(&worker.dispatch(event).await?.into_json()?)?;
    }
    Command::Click {
      notification,
      action,
    } => {
      let notification: Notification = serde_json::from_str(&notification)
        .map_err(|e| eyre!("Failed to parse notification: {}", e))?;
      let event = WorkerEvent::NotificationClick {
        notification,
        action,
      };
      print_json(&worker.dispatch(event).await?.into_json()?)?;
    }
    Command::Partitions => {
      let mut rows = Vec::new();
      for name in storage.partition_names()? {
        let entries = storage.entry_count(&name)?;
        let current = worker.lifecycle().partitions().contains(&name);
        rows.push(serde_json::json!({ "name": name, "entries": entries, "current": current }));
      }
      print_json(&rows)?;
    }
    Command::Pending => {
      print_json(&storage.pending()?)?;
    }
    Command::Serve { listen } => {
      worker.start().await?;
      offcache::serve::run(Arc::new(worker), config.origin.clone(), listen).await?;
    }
  }

  Ok(())
}

/// Log to stderr, or to a file through a non-blocking writer.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("OFFCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  match log_file {
    Some(path) => {
      let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
      Ok(None)
    }
  }
}

fn parse_header(raw: &str) -> Result<(&str, &str)> {
  raw
    .split_once(':')
    .map(|(name, value)| (name.trim(), value.trim()))
    .ok_or_else(|| eyre!("Invalid header {:?}, expected `name: value`", raw))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let out =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", out);
  Ok(())
}
