//! Concurrent file scheduler.
//!
//! Admits file ingestions under a bounded work set. Admission defers while
//! the embedding queue asserts backpressure (effective concurrency is
//! halved), while process memory sits above the soft ceiling, while the
//! scheduler is paused, and while the embedding service is unavailable.
//! Within a scan wave smaller files go first so one large file cannot hold
//! every slot.

use crate::ingest::{IngestContext, ingest_file};
use crate::scanner::{ScannedFile, Scanner};
use crate::watcher::{ChangeKind, FileChange};
use embedding::Embedder;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct FileScheduler {
  inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
  ctx: IngestContext,
  scanner: Scanner,
  embedder: Arc<dyn Embedder>,
  max_concurrent: usize,
  memory_ceiling_bytes: u64,
  backpressure: watch::Receiver<bool>,
  paused: watch::Sender<bool>,
  in_flight: AtomicUsize,
  pending: AtomicUsize,
  active: Mutex<HashSet<String>>,
  slot_freed: Notify,
  /// Cancels pending admissions
  cancel: CancellationToken,
  /// Cancels in-flight ingestions (separate so stop can drain)
  ingest_cancel: CancellationToken,
}

/// Effective concurrency limit; halved while backpressure is asserted.
fn effective_limit(max_concurrent: usize, backpressure: bool) -> usize {
  if backpressure {
    (max_concurrent / 2).max(1)
  } else {
    max_concurrent
  }
}

impl FileScheduler {
  pub fn new(
    ctx: IngestContext,
    scanner: Scanner,
    embedder: Arc<dyn Embedder>,
    config: &semadex_core::SchedulerConfig,
    backpressure: watch::Receiver<bool>,
  ) -> Self {
    let (paused, _) = watch::channel(false);
    Self {
      inner: Arc::new(SchedulerInner {
        ctx,
        scanner,
        embedder,
        max_concurrent: config.max_concurrent_files.max(1),
        memory_ceiling_bytes: config.memory_soft_ceiling_mb * 1024 * 1024,
        backpressure,
        paused,
        in_flight: AtomicUsize::new(0),
        pending: AtomicUsize::new(0),
        active: Mutex::new(HashSet::new()),
        slot_freed: Notify::new(),
        cancel: CancellationToken::new(),
        ingest_cancel: CancellationToken::new(),
      }),
    }
  }

  /// Files currently being ingested.
  pub fn processing(&self) -> usize {
    self.inner.in_flight.load(Ordering::SeqCst)
  }

  /// Files waiting for an admission slot.
  pub fn pending(&self) -> usize {
    self.inner.pending.load(Ordering::SeqCst)
  }

  pub fn pause(&self) {
    info!("Scheduler paused");
    let _ = self.inner.paused.send_replace(true);
  }

  pub fn resume(&self) {
    info!("Scheduler resumed");
    let _ = self.inner.paused.send_replace(false);
  }

  pub fn is_paused(&self) -> bool {
    *self.inner.paused.borrow()
  }

  /// Stop admitting new work. In-flight ingestions run to completion.
  pub fn stop(&self) {
    self.inner.cancel.cancel();
  }

  /// Cancel in-flight ingestions too.
  pub fn cancel_inflight(&self) {
    self.inner.ingest_cancel.cancel();
  }

  /// Wait until nothing is pending or in flight.
  pub async fn wait_idle(&self) {
    loop {
      if self.pending() == 0 && self.processing() == 0 {
        return;
      }
      tokio::time::sleep(Duration::from_millis(25)).await;
    }
  }

  /// Admit a wave of scanned files, smallest first.
  pub async fn run_wave(&self, mut files: Vec<ScannedFile>) {
    if files.is_empty() {
      return;
    }

    files.sort_by_key(|f| f.size);
    self.inner.pending.fetch_add(files.len(), Ordering::SeqCst);
    debug!(files = files.len(), "Scheduling wave");

    for file in files {
      let admitted = self.admit_when_ready().await;
      self.inner.pending.fetch_sub(1, Ordering::SeqCst);
      if !admitted {
        continue;
      }
      self.spawn_ingest(file);
    }
  }

  /// React to a watcher event.
  pub async fn handle_event(&self, change: FileChange) {
    match change.kind {
      ChangeKind::Deleted => {
        let path = change.path.to_string_lossy().to_string();
        info!(path, "File deleted, removing from index");
        if let Err(e) = self.inner.ctx.db.delete_by_path(&path).await {
          warn!(path, error = %e, "Failed to delete vectors for removed file");
        }
        if let Err(e) = self.inner.ctx.db.delete_file_status(&path).await {
          warn!(path, error = %e, "Failed to delete status for removed file");
        }
      }
      ChangeKind::Created | ChangeKind::Modified => {
        if let Some(file) = self.inner.scanner.scan_file(&change.path, &self.inner.ctx.registry) {
          self.run_wave(vec![file]).await;
        }
      }
    }
  }

  /// Block until an admission slot is available; false when stopped.
  async fn admit_when_ready(&self) -> bool {
    let inner = &self.inner;
    let mut backpressure = inner.backpressure.clone();
    let mut paused = inner.paused.subscribe();

    loop {
      if inner.cancel.is_cancelled() {
        return false;
      }

      if *paused.borrow_and_update() {
        tokio::select! {
          _ = inner.cancel.cancelled() => return false,
          _ = paused.changed() => {}
        }
        continue;
      }

      if !inner.embedder.health().await {
        // Halt admissions until the embedding service recovers
        tokio::select! {
          _ = inner.cancel.cancelled() => return false,
          _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        continue;
      }

      if inner.over_memory_ceiling() {
        tokio::select! {
          _ = inner.cancel.cancelled() => return false,
          _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        continue;
      }

      let limit = effective_limit(inner.max_concurrent, *backpressure.borrow_and_update());
      // Register before the check so a freed slot is not missed
      let slot = inner.slot_freed.notified();
      if inner.in_flight.load(Ordering::SeqCst) < limit {
        return true;
      }

      tokio::select! {
        _ = inner.cancel.cancelled() => return false,
        _ = slot => {}
        _ = backpressure.changed() => {}
      }
    }
  }

  fn spawn_ingest(&self, file: ScannedFile) {
    let path = file.path.to_string_lossy().to_string();

    // A path is owned by at most one active ingestion
    {
      let mut active = self.inner.active.lock().expect("active set lock");
      if !active.insert(path.clone()) {
        debug!(path, "Ingestion already active for path, skipping");
        return;
      }
    }

    self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
    let inner = self.inner.clone();
    tokio::spawn(async move {
      let outcome = ingest_file(&inner.ctx, &file, &inner.ingest_cancel).await;
      debug!(path, ?outcome, "Ingestion finished");

      inner.active.lock().expect("active set lock").remove(&path);
      inner.in_flight.fetch_sub(1, Ordering::SeqCst);
      inner.slot_freed.notify_waiters();
    });
  }
}

impl SchedulerInner {
  fn over_memory_ceiling(&self) -> bool {
    if self.memory_ceiling_bytes == 0 {
      return false;
    }
    match process_rss_bytes() {
      Some(rss) if rss > self.memory_ceiling_bytes => {
        warn!(rss, ceiling = self.memory_ceiling_bytes, "Process over memory soft ceiling, pausing admissions");
        true
      }
      _ => false,
    }
  }
}

#[cfg(target_os = "linux")]
fn process_rss_bytes() -> Option<u64> {
  let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
  let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
  Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn process_rss_bytes() -> Option<u64> {
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chunker::Chunker;
  use crate::parser::ParserRegistry;
  use crate::queue::{EmbedQueue, run_consumer};
  use db::SearchDb;
  use embedding::MockEmbedder;
  use semadex_core::{Config, IndexState, QueueConfig, SchedulerConfig};
  use tempfile::TempDir;

  struct Fixture {
    _data_dir: TempDir,
    root: TempDir,
    db: Arc<SearchDb>,
    scheduler: FileScheduler,
    consumer_cancel: CancellationToken,
  }

  async fn fixture(max_concurrent: usize) -> Fixture {
    let data_dir = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();

    let db = Arc::new(SearchDb::open(data_dir.path(), 8).await.unwrap());
    let queue = EmbedQueue::new(QueueConfig::default());
    let embedder: Arc<MockEmbedder> = Arc::new(MockEmbedder::new(8));
    let consumer_cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), consumer_cancel.clone()));

    let ctx = IngestContext {
      db: db.clone(),
      queue: queue.clone(),
      registry: Arc::new(ParserRegistry::builtin()),
      chunker: Chunker::default(),
      failed_retry: Duration::from_secs(24 * 3600),
      ingestion_timeout: Duration::from_secs(10),
    };

    let scheduler = FileScheduler::new(
      ctx,
      Scanner::new(&Config::default().watch),
      embedder,
      &SchedulerConfig {
        max_concurrent_files: max_concurrent,
        ..SchedulerConfig::default()
      },
      queue.subscribe_backpressure(),
    );

    Fixture {
      _data_dir: data_dir,
      root,
      db,
      scheduler,
      consumer_cancel,
    }
  }

  impl Fixture {
    fn write_files(&self, count: usize) -> Vec<ScannedFile> {
      let scanner = Scanner::new(&Config::default().watch);
      let registry = ParserRegistry::builtin();
      (0..count)
        .map(|i| {
          let path = self.root.path().join(format!("file{i}.txt"));
          std::fs::write(&path, format!("document number {i}. more text follows.")).unwrap();
          scanner.scan_file(&path, &registry).unwrap()
        })
        .collect()
    }
  }

  #[test]
  fn test_effective_limit_halves_under_backpressure() {
    assert_eq!(effective_limit(4, false), 4);
    assert_eq!(effective_limit(4, true), 2);
    assert_eq!(effective_limit(1, true), 1);
  }

  #[tokio::test]
  async fn test_wave_indexes_all_files() {
    let fx = fixture(2).await;
    let files = fx.write_files(5);
    let paths: Vec<String> = files.iter().map(|f| f.path.to_string_lossy().to_string()).collect();

    fx.scheduler.run_wave(files).await;
    fx.scheduler.wait_idle().await;

    for path in paths {
      let status = fx.db.file_status(&path).await.unwrap().unwrap();
      assert_eq!(status.state, IndexState::Indexed, "{path} should be indexed");
    }
    fx.consumer_cancel.cancel();
  }

  #[tokio::test]
  async fn test_pause_defers_admission() {
    let fx = fixture(2).await;
    let files = fx.write_files(2);
    let path = files[0].path.to_string_lossy().to_string();

    fx.scheduler.pause();
    let scheduler = fx.scheduler.clone();
    let wave = tokio::spawn(async move { scheduler.run_wave(files).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.db.file_status(&path).await.unwrap().is_none(), "nothing indexed while paused");

    fx.scheduler.resume();
    wave.await.unwrap();
    fx.scheduler.wait_idle().await;

    let status = fx.db.file_status(&path).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Indexed);
    fx.consumer_cancel.cancel();
  }

  #[tokio::test]
  async fn test_stop_cancels_pending_admissions() {
    let fx = fixture(1).await;
    fx.scheduler.pause();

    let files = fx.write_files(3);
    let scheduler = fx.scheduler.clone();
    let wave = tokio::spawn(async move { scheduler.run_wave(files).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.scheduler.stop();

    // Wave completes without admitting anything
    wave.await.unwrap();
    assert_eq!(fx.scheduler.processing(), 0);
    fx.consumer_cancel.cancel();
  }

  #[tokio::test]
  async fn test_deleted_event_removes_index_entries() {
    let fx = fixture(2).await;
    let files = fx.write_files(1);
    let path = files[0].path.clone();
    let path_str = path.to_string_lossy().to_string();

    fx.scheduler.run_wave(files).await;
    fx.scheduler.wait_idle().await;
    assert!(!fx.db.rows_for_path(&path_str).await.unwrap().is_empty());

    fx.scheduler
      .handle_event(FileChange {
        path,
        kind: ChangeKind::Deleted,
      })
      .await;

    assert!(fx.db.rows_for_path(&path_str).await.unwrap().is_empty());
    assert!(fx.db.file_status(&path_str).await.unwrap().is_none());
    fx.consumer_cancel.cancel();
  }

  #[tokio::test]
  async fn test_modified_event_reindexes() {
    let fx = fixture(2).await;
    let files = fx.write_files(1);
    let path = files[0].path.clone();
    let path_str = path.to_string_lossy().to_string();

    fx.scheduler.run_wave(files).await;
    fx.scheduler.wait_idle().await;

    std::fs::write(&path, "completely different content now.").unwrap();
    fx.scheduler
      .handle_event(FileChange {
        path,
        kind: ChangeKind::Modified,
      })
      .await;
    fx.scheduler.wait_idle().await;

    let rows = fx.db.rows_for_path(&path_str).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].text, "completely different content now.");
    fx.consumer_cancel.cancel();
  }
}
