use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use offgrid::app::App;
use offgrid::cache::TierName;
use offgrid::config::Config;
use offgrid::control::Command;
use offgrid::db::Database;
use offgrid::event::EventHandler;
use offgrid::fetch::HttpFetcher;
use offgrid::interceptor::Interceptor;
use offgrid::queue::QueueName;

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline-resilient caching and deferred sync for local-first apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Serve JSON-line control commands on stdin/stdout
  Serve,
  /// Print cache, queue and network status
  Status,
  /// Drain deferred requests now
  Sync {
    /// Queue to drain (default: all)
    queue: Option<String>,
  },
  /// Clear cached entries
  Clear {
    /// Tier to clear (default: all)
    tier: Option<String>,
  },
  /// Fetch and store URLs in their cache tiers
  Preload {
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// Send one request through the interception layer
  Fetch {
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    #[arg(short = 'd', long)]
    body: Option<String>,
    url: String,
  },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;

  // stdout carries the protocol in serve mode, so logs go to a file there
  let _guard = init_logging(matches!(args.command, Cmd::Serve), &data_dir)?;

  let db = Database::open(&data_dir.join("offgrid.db"))?;
  let fetcher = Arc::new(HttpFetcher::new()?);
  let interceptor = Interceptor::new(config, db, fetcher);

  let command = match args.command {
    Cmd::Serve => return serve(interceptor).await,
    Cmd::Status => Command::GetStatus,
    Cmd::Sync { queue } => Command::ForceSync {
      queue: queue.as_deref().map(parse_queue).transpose()?,
    },
    Cmd::Clear { tier } => Command::ClearCache {
      tier: tier.as_deref().map(parse_tier).transpose()?,
    },
    Cmd::Preload { urls } => Command::Preload { urls },
    Cmd::Fetch { method, body, url } => Command::Fetch {
      method,
      url,
      headers: Default::default(),
      body,
    },
  };

  let result = interceptor.command(command).await?;
  let pretty =
    serde_json::to_string_pretty(&result).map_err(|e| eyre!("Failed to format result: {}", e))?;
  println!("{}", pretty);

  Ok(())
}

async fn serve(interceptor: Interceptor) -> Result<()> {
  interceptor.activate()?;
  interceptor.install().await;
  let background = interceptor.spawn_background();

  let mut events = EventHandler::new(Duration::from_secs(
    interceptor.config().queue.sync_interval_secs,
  ));
  events.read_lines(tokio::io::stdin());
  events.watch_network(interceptor.monitor().subscribe());
  events.forward_broadcasts(interceptor.subscribe());

  let mut app = App::new(interceptor, tokio::io::stdout());
  let result = app.run(&mut events).await;

  for task in background {
    task.abort();
  }
  result
}

fn init_logging(to_file: bool, data_dir: &Path) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("OFFGRID_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  if to_file {
    let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "offgrid.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
      .with(filter)
      .with(
        tracing_subscriber::fmt::layer()
          .with_writer(writer)
          .with_ansi(false),
      )
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(Some(guard));
  }

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
  Ok(None)
}

fn parse_queue(name: &str) -> Result<QueueName> {
  QueueName::parse(name).ok_or_else(|| {
    let known: Vec<_> = QueueName::ALL.iter().map(|q| q.as_str()).collect();
    eyre!("Unknown queue '{}' (expected one of: {})", name, known.join(", "))
  })
}

fn parse_tier(name: &str) -> Result<TierName> {
  TierName::parse(name).ok_or_else(|| {
    let known: Vec<_> = TierName::ALL.iter().map(|t| t.as_str()).collect();
    eyre!("Unknown tier '{}' (expected one of: {})", name, known.join(", "))
  })
}
