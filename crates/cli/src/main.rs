//! Semadex CLI - offline semantic search for local files

use anyhow::Result;
use clap::{Parser, Subcommand};
use daemon::Daemon;
use semadex_core::Config;
use std::path::PathBuf;
use tracing::info;

mod logging;

#[derive(Parser)]
#[command(name = "semadex")]
#[command(about = "Offline semantic search for your local files")]
#[command(after_help = "\
QUICK START:
  semadex run --foreground        # Start indexing the configured roots
  semadex index ~/Documents       # One-shot index of a directory
  semadex search \"tax return\"     # Search the index
  semadex status                  # Show index statistics")]
struct Cli {
  /// Config file (defaults to the user config)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Storage directory override
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the indexing daemon until interrupted
  Run {
    /// Stay attached to the console
    #[arg(long)]
    foreground: bool,
  },
  /// Scan and index the watched roots, or specific paths
  Index {
    /// Files or directories to index instead of the configured roots
    paths: Vec<PathBuf>,
    /// Re-index even unchanged files
    #[arg(long)]
    force: bool,
  },
  /// Search the index
  Search {
    query: String,
    /// Number of result groups
    #[arg(short = 'k', long, default_value_t = 10)]
    limit: usize,
  },
  /// Show index statistics
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let config = Config::load(cli.config.as_deref());
  let data_dir = cli.data_dir.clone().unwrap_or_else(Config::data_dir);

  match cli.command {
    Commands::Run { foreground } => {
      let _guard = logging::init_daemon_logging(foreground);
      let daemon = Daemon::start(config, data_dir).await?;

      if daemon.report().migrated {
        info!("Store was migrated; a full re-index is running");
      }
      daemon.index(None).await;

      tokio::signal::ctrl_c().await?;
      daemon.shutdown().await;
    }

    Commands::Index { paths, force } => {
      logging::init_cli_logging();
      let daemon = Daemon::start(config, data_dir).await?;

      let targets = (!paths.is_empty()).then_some(paths);
      let scheduled = if force {
        daemon.reindex(targets).await
      } else {
        daemon.index(targets).await
      };

      let stats = daemon.stats();
      println!("Scheduled {scheduled} files: {} indexed, {} failed", stats.indexed, stats.failed);
      daemon.shutdown().await;
    }

    Commands::Search { query, limit } => {
      logging::init_cli_logging();
      let daemon = Daemon::start(config, data_dir).await?;

      let groups = daemon.search(&query, limit).await?;
      if groups.is_empty() {
        println!("No results");
      }
      for group in groups {
        println!("{}  (score {:.3})", group.path, group.top_hit.score);
        for hit in group.hits.iter().take(3) {
          println!("  #{} @{}  {}", hit.chunk_index, hit.offset, snippet(&hit.text));
        }
      }
      daemon.shutdown().await;
    }

    Commands::Status => {
      logging::init_cli_logging();
      let daemon = Daemon::start(config, data_dir).await?;

      let stats = daemon.stats();
      let store = daemon.db().stats().await?;
      println!("indexed files: {}", stats.indexed);
      println!("failed files:  {}", stats.failed);
      println!("vector rows:   {}", store.row_count);
      println!("paths:         {}", store.distinct_paths);
      daemon.shutdown().await;
    }
  }

  Ok(())
}

/// One-line preview of a chunk.
fn snippet(text: &str) -> String {
  let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
  if flat.chars().count() <= 96 {
    flat
  } else {
    let mut s: String = flat.chars().take(96).collect();
    s.push('…');
    s
  }
}
