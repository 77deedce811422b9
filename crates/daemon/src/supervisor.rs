//! Startup coordinator and control surface.
//!
//! Brings the components up in dependency order, each stage with its own
//! failure tag: storage (lock + schema migration) → embedding service →
//! status cache (+ reconciliation) → scheduler and queue consumer →
//! watcher. A constructed [`Daemon`] is the "ready" signal the UI layer
//! gates on. Shutdown walks the reverse order.

use crate::lock::{InstanceLock, LockError};
use crate::search::{GroupedResult, SearchError, SearchService};
use db::SearchDb;
use embedding::{EmbedService, Embedder, ServiceConfig};
use index::{
  Chunker, DebounceConfig, Debouncer, EmbedQueue, FileScheduler, FileWatcher, IngestContext, ParserRegistry,
  ScannedFile, Scanner, run_consumer, watch_loop,
};
use semadex_core::{Config, IndexState};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Startup stage, used to tag startup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Storage,
  EmbeddingService,
  StatusCache,
  Scheduler,
  Watcher,
}

impl std::fmt::Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Stage::Storage => "storage",
      Stage::EmbeddingService => "embedding_service",
      Stage::StatusCache => "status_cache",
      Stage::Scheduler => "scheduler",
      Stage::Watcher => "watcher",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum SupervisorError {
  #[error("startup failed at stage {stage}: {message}")]
  StartupFailed { stage: Stage, message: String },
  #[error(transparent)]
  Lock(#[from] LockError),
}

fn stage_err(stage: Stage, error: impl std::fmt::Display) -> SupervisorError {
  SupervisorError::StartupFailed {
    stage,
    message: error.to_string(),
  }
}

/// What startup did, surfaced so the UI can show the one-time re-indexing
/// state after a destructive migration.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
  pub migrated: bool,
  pub reset_transient: usize,
  pub parser_outdated: usize,
}

/// Indexing counters for the UI.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
  pub indexed: usize,
  pub queued: usize,
  pub processing: usize,
  pub failed: usize,
}

/// The running system.
pub struct Daemon {
  config: Config,
  db: Arc<SearchDb>,
  embedder: Arc<dyn Embedder>,
  queue: Arc<EmbedQueue>,
  scheduler: FileScheduler,
  registry: Arc<ParserRegistry>,
  search: SearchService,
  report: StartupReport,
  cancel: CancellationToken,
  _lock: InstanceLock,
}

impl Daemon {
  /// Full startup with the supervised embedding service.
  pub async fn start(config: Config, data_dir: PathBuf) -> Result<Self, SupervisorError> {
    let (lock, db) = open_storage(&config, &data_dir).await?;

    let service = EmbedService::start(ServiceConfig::from_config(&config.embedding))
      .await
      .map_err(|e| stage_err(Stage::EmbeddingService, e))?;
    let embedder: Arc<dyn Embedder> = Arc::new(service);
    info!("Embedding service started");

    let registry = Arc::new(ParserRegistry::from_config(&config));
    Self::finish_start(config, db, embedder, registry, lock).await
  }

  /// Startup with an injected embedder (alternative transports, tests).
  pub async fn start_with_embedder(
    config: Config,
    data_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
  ) -> Result<Self, SupervisorError> {
    let registry = Arc::new(ParserRegistry::from_config(&config));
    Self::start_with_registry(config, data_dir, embedder, registry).await
  }

  /// Startup with an injected embedder and parser registry.
  pub async fn start_with_registry(
    config: Config,
    data_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    registry: Arc<ParserRegistry>,
  ) -> Result<Self, SupervisorError> {
    let (lock, db) = open_storage(&config, &data_dir).await?;
    Self::finish_start(config, db, embedder, registry, lock).await
  }

  async fn finish_start(
    config: Config,
    db: Arc<SearchDb>,
    embedder: Arc<dyn Embedder>,
    registry: Arc<ParserRegistry>,
    lock: InstanceLock,
  ) -> Result<Self, SupervisorError> {
    // Stage 3: status cache and reconciliation
    db.bulk_load_status_cache()
      .await
      .map_err(|e| stage_err(Stage::StatusCache, e))?;
    let reset_transient = db
      .reset_transient_statuses()
      .await
      .map_err(|e| stage_err(Stage::StatusCache, e))?;
    let parser_outdated = reconcile_parser_versions(&db, &registry)
      .await
      .map_err(|e| stage_err(Stage::StatusCache, e))?;

    let report = StartupReport {
      migrated: db.migrated,
      reset_transient,
      parser_outdated,
    };

    // Stage 4: queue consumer, scheduler, watcher
    let cancel = CancellationToken::new();
    let queue = EmbedQueue::new(config.queue.clone());
    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), cancel.child_token()));

    let ctx = IngestContext {
      db: db.clone(),
      queue: queue.clone(),
      registry: registry.clone(),
      chunker: Chunker::new((&config.index).into()),
      failed_retry: Duration::from_secs(config.scheduler.failed_retry_hours * 3600),
      ingestion_timeout: Duration::from_millis(config.scheduler.ingestion_timeout_ms),
    };

    let scanner = Scanner::new(&config.watch);
    let filter = scanner.filter().clone();
    let scheduler = FileScheduler::new(
      ctx,
      scanner,
      embedder.clone(),
      &config.scheduler,
      queue.subscribe_backpressure(),
    );

    let watch_roots: Vec<PathBuf> = config
      .watch
      .watched_roots
      .iter()
      .filter(|root| {
        let exists = root.is_dir();
        if !exists {
          warn!(root = %root.display(), "Watched root does not exist, skipping watch");
        }
        exists
      })
      .cloned()
      .collect();

    if !watch_roots.is_empty() {
      let watcher = FileWatcher::new(&watch_roots).map_err(|e| stage_err(Stage::Watcher, e))?;
      let debouncer = Debouncer::new(DebounceConfig {
        debounce: Duration::from_millis(config.watch.debounce_ms),
        ..DebounceConfig::default()
      });
      tokio::spawn(watch_loop(
        watcher,
        debouncer,
        filter,
        scheduler.clone(),
        cancel.child_token(),
      ));
    }

    let search = SearchService::new(embedder.clone(), db.clone(), config.search.grouping_factor);

    // Stage 5: ready
    info!(migrated = report.migrated, "Semadex ready");
    Ok(Self {
      config,
      db,
      embedder,
      queue,
      scheduler,
      registry,
      search,
      report,
      cancel,
      _lock: lock,
    })
  }

  pub fn report(&self) -> &StartupReport {
    &self.report
  }

  pub fn db(&self) -> Arc<SearchDb> {
    self.db.clone()
  }

  /// Scan and index. With `paths` only those files/directories are
  /// considered; without, the configured roots are scanned and orphaned
  /// index entries are swept. Returns the number of files scheduled.
  pub async fn index(&self, paths: Option<Vec<PathBuf>>) -> usize {
    let scanner = Scanner::new(&self.config.watch);
    let explicit = paths.is_some();
    let targets = paths.unwrap_or_else(|| self.config.watch.watched_roots.clone());

    let mut files = Vec::new();
    for target in &targets {
      if target.is_dir() {
        files.extend(scanner.scan(target, &self.registry).files);
      } else if let Some(file) = scanner.scan_file(target, &self.registry) {
        files.push(file);
      }
    }

    if !explicit {
      self.sweep_orphans(&files).await;
    }

    let count = files.len();
    info!(files = count, "Indexing wave starting");
    self.scheduler.run_wave(files).await;
    self.scheduler.wait_idle().await;
    count
  }

  /// Force a re-index: targets are marked outdated first.
  pub async fn reindex(&self, paths: Option<Vec<PathBuf>>) -> usize {
    match &paths {
      Some(list) => {
        for path in list {
          let key = path.to_string_lossy().to_string();
          if let Ok(Some(mut status)) = self.db.file_status(&key).await {
            status.state = IndexState::Outdated;
            let _ = self.db.set_file_status(&status).await;
          }
        }
      }
      None => {
        if let Err(e) = self.db.mark_all_outdated().await {
          warn!(error = %e, "Failed to mark store outdated");
        }
      }
    }
    self.index(paths).await
  }

  pub async fn search(&self, query: &str, k: usize) -> Result<Vec<GroupedResult>, SearchError> {
    self.search.search(query, k).await
  }

  pub fn stats(&self) -> Stats {
    let counts = self.db.status_counts();
    Stats {
      indexed: counts.get(&IndexState::Indexed).copied().unwrap_or(0),
      queued: self.scheduler.pending(),
      processing: self.scheduler.processing(),
      failed: counts.get(&IndexState::Failed).copied().unwrap_or(0),
    }
  }

  pub fn pause(&self) {
    self.scheduler.pause();
  }

  pub fn resume(&self) {
    self.scheduler.resume();
  }

  /// Queue depth, exposed for monitoring.
  pub fn queue_depth(&self) -> usize {
    self.queue.depth()
  }

  /// Ordered shutdown: watcher → scheduler → queue → embedding service →
  /// store and lock (on drop).
  pub async fn shutdown(self) {
    info!("Shutting down");
    self.scheduler.stop();
    self.scheduler.cancel_inflight();
    self.queue.close();
    self.cancel.cancel();
    self.scheduler.wait_idle().await;
    self.embedder.shutdown().await;
    info!("Shutdown complete");
  }

  /// Remove index entries whose files vanished from the watched roots.
  async fn sweep_orphans(&self, present: &[ScannedFile]) {
    let present_paths: HashSet<String> = present.iter().map(|f| f.path.to_string_lossy().to_string()).collect();

    let statuses = match self.db.all_statuses().await {
      Ok(statuses) => statuses,
      Err(e) => {
        warn!(error = %e, "Orphan sweep failed to list statuses");
        return;
      }
    };

    for status in statuses {
      if present_paths.contains(&status.path) {
        continue;
      }
      info!(path = %status.path, "Sweeping orphaned index entry");
      if let Err(e) = self.db.delete_by_path(&status.path).await {
        warn!(path = %status.path, error = %e, "Failed to delete orphaned vectors");
      }
      if let Err(e) = self.db.delete_file_status(&status.path).await {
        warn!(path = %status.path, error = %e, "Failed to delete orphaned status");
      }
    }
  }
}

/// Stage 1: storage directory, exclusive lock, schema migration.
async fn open_storage(config: &Config, data_dir: &Path) -> Result<(InstanceLock, Arc<SearchDb>), SupervisorError> {
  let lock = InstanceLock::acquire(data_dir)?;

  let db = tokio::time::timeout(STAGE_TIMEOUT, SearchDb::open(data_dir, config.embedding.dimensions))
    .await
    .map_err(|_| stage_err(Stage::Storage, "timed out opening storage"))?
    .map_err(|e| stage_err(Stage::Storage, e))?;

  Ok((lock, Arc::new(db)))
}

/// Mark files indexed with an older parser version as outdated.
async fn reconcile_parser_versions(db: &SearchDb, registry: &ParserRegistry) -> Result<usize, db::DbError> {
  let statuses = db.all_statuses().await?;
  let mut touched = 0;

  for mut status in statuses {
    let path = PathBuf::from(&status.path);
    if let Some(current) = registry.current_version(&path)
      && status.state == IndexState::Indexed
      && status.parser_version < current
    {
      status.state = IndexState::Outdated;
      db.set_file_status(&status).await?;
      touched += 1;
    }
  }

  if touched > 0 {
    info!(touched, "Marked files outdated after parser upgrade");
  }
  Ok(touched)
}
