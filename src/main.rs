use async_trait::async_trait;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;

use tillsync::config::Config;
use tillsync::engine::PosEngine;
use tillsync::remote::rest::RestRemote;
use tillsync::remote::{AuthSession, SessionProvider};

#[derive(Parser, Debug)]
#[command(name = "tillsync")]
#[command(about = "Offline-resilient POS cache and sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tillsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pull remote product changes into the local cache
  Sync {
    /// Ignore the delta window and fetch the full tenant set
    #[arg(long)]
    force: bool,
  },
  /// Drain queued sales to the remote store
  Drain,
  /// Search the local product cache
  Search { query: String },
  /// Show cache metrics and queue depth
  Metrics,
  /// Run the background scheduler until interrupted
  Watch,
}

/// Session provider for headless runs: identity comes from the
/// environment rather than an interactive login.
struct EnvSession;

#[async_trait]
impl SessionProvider for EnvSession {
  async fn session(&self) -> Option<AuthSession> {
    let user_id = std::env::var("TILLSYNC_USER_ID").ok()?;
    Some(AuthSession {
      user_id,
      tenant_id: std::env::var("TILLSYNC_TENANT_ID").ok(),
    })
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tillsync=info")),
    )
    .init();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let api_key = Config::get_api_key()?;
  let remote = Arc::new(RestRemote::new(&config.remote, api_key)?);
  let engine = PosEngine::open(config, remote, Arc::new(EnvSession))?;

  // A CLI invocation implies connectivity was requested; failures still
  // degrade to the offline paths.
  engine.set_online(true);

  match args.command {
    Command::Sync { force } => {
      let outcome = engine.sync_products(force).await;
      if outcome.success {
        println!("synced {} products", outcome.synced);
      } else {
        println!("sync failed, local cache left untouched");
      }
    }
    Command::Drain => {
      let outcome = engine.drain_sales().await;
      println!(
        "drained {} sales, {} still pending",
        outcome.synced,
        engine.pending_sales().len()
      );
    }
    Command::Search { query } => {
      let results = engine.search_products(&query).await?;
      for product in &results {
        println!(
          "{}\t{}\t{:.2}\t(stock {})",
          product.id, product.name, product.price, product.stock
        );
      }
      if results.is_empty() {
        println!("no matches");
      }
    }
    Command::Metrics => {
      let metrics = engine.cache_metrics()?;
      println!("cached products: {}", metrics.total_products);
      println!(
        "last sync:       {}",
        metrics
          .last_sync_time
          .map(|ms| ms.to_string())
          .unwrap_or_else(|| "never".to_string())
      );
      println!("hits/misses:     {}/{}", metrics.hits, metrics.misses);
      println!("queued sales:    {}", engine.pending_sales().len());
    }
    Command::Watch => {
      let handle = engine.controller().run();
      println!("scheduler running, press ctrl-c to stop");
      tokio::signal::ctrl_c().await?;
      handle.abort();
    }
  }

  Ok(())
}
