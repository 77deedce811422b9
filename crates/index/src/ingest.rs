//! Per-file ingestion state machine.
//!
//! ```text
//! Discovered → NeedsIndex? → Parsing → Chunking → Enqueued → AwaitingVectors → Committing → Indexed
//!                                │                                                   │
//!                                ▼                                                   ▼
//!                             Failed ◄──────────── (any step can fail) ──────────────┘
//! ```
//!
//! Commit order is replace-then-status: vectors are written first, the file
//! status second. A crash between the two leaves new rows with a stale
//! status, which the next startup resolves by re-indexing the file.
//! Vectors already in the store are never touched before embedding has
//! succeeded, so an embed failure keeps the previous successful index
//! searchable.

use crate::chunker::Chunker;
use crate::parser::ParserRegistry;
use crate::queue::{EmbedQueue, IngestionOutcome};
use crate::scanner::ScannedFile;
use chrono::{TimeDelta, Utc};
use db::SearchDb;
use semadex_core::{Chunk, FileStatus, IndexState, VectorRow, row_id};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared dependencies for file ingestions. Cheap to clone.
#[derive(Clone)]
pub struct IngestContext {
  pub db: Arc<SearchDb>,
  pub queue: Arc<EmbedQueue>,
  pub registry: Arc<ParserRegistry>,
  pub chunker: Chunker,
  /// Age before a failed file becomes eligible for retry
  pub failed_retry: Duration,
  /// Soft timeout for one ingestion
  pub ingestion_timeout: Duration,
}

/// Terminal result of one ingestion attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
  Indexed { chunks: usize },
  Skipped,
  Failed(String),
  Cancelled,
}

/// The re-index decision.
///
/// Index when there is no record, the content hash changed, the parser
/// version advanced, the file is marked outdated, or a failed file has aged
/// past the retry window. Transient states left behind by a crash also
/// re-index.
pub fn needs_index(
  status: Option<&FileStatus>,
  file: &ScannedFile,
  current_parser_version: u32,
  failed_retry: Duration,
) -> bool {
  let Some(status) = status else {
    return true;
  };

  match status.state {
    IndexState::Outdated => true,
    IndexState::Failed => {
      let retry_age = TimeDelta::from_std(failed_retry).unwrap_or(TimeDelta::hours(24));
      current_parser_version > status.parser_version || Utc::now() - status.indexed_at >= retry_age
    }
    IndexState::Indexed => {
      status.content_hash != file.content_hash || status.parser_version < current_parser_version
    }
    // Queued / Parsing / Embedding left behind by a crash
    _ => true,
  }
}

/// Run the full pipeline for one file.
pub async fn ingest_file(ctx: &IngestContext, file: &ScannedFile, cancel: &CancellationToken) -> IngestOutcome {
  let path = file.path.to_string_lossy().to_string();

  let Some(parser_version) = ctx.registry.current_version(&file.path) else {
    return IngestOutcome::Skipped;
  };

  let previous = match ctx.db.file_status(&path).await {
    Ok(status) => status,
    Err(e) => return IngestOutcome::Failed(e.to_string()),
  };

  if !needs_index(previous.as_ref(), file, parser_version, ctx.failed_retry) {
    return IngestOutcome::Skipped;
  }

  debug!(path, "Ingesting file");
  set_status(ctx, &file.path, file, parser_version, IndexState::Parsing, None).await;

  // Parsing
  let text = match ctx.registry.parse(&file.path) {
    Ok(text) => text,
    Err(e) => {
      let message = e.to_string();
      warn!(path, error = %message, "Parse failed");
      set_status(ctx, &file.path, file, parser_version, IndexState::Failed, Some(message.clone())).await;
      return IngestOutcome::Failed(message);
    }
  };

  if cancel.is_cancelled() {
    set_status(ctx, &file.path, file, parser_version, IndexState::Outdated, None).await;
    return IngestOutcome::Cancelled;
  }

  // Chunking
  let chunks = ctx.chunker.chunk(&text);
  if chunks.is_empty() {
    // Empty text indexes successfully with zero rows
    if let Err(e) = ctx.db.replace_file(&path, &[]).await {
      set_status(ctx, &file.path, file, parser_version, IndexState::Failed, Some(e.to_string())).await;
      return IngestOutcome::Failed(e.to_string());
    }
    commit_status(ctx, &path, file, parser_version, 0).await;
    debug!(path, "Indexed empty file");
    return IngestOutcome::Indexed { chunks: 0 };
  }

  // Enqueued
  set_status(ctx, &file.path, file, parser_version, IndexState::Embedding, None).await;
  let handle = match ctx.queue.add_chunks(&path, &chunks).await {
    Ok(handle) => handle,
    Err(e) => {
      set_status(ctx, &file.path, file, parser_version, IndexState::Failed, Some(e.to_string())).await;
      return IngestOutcome::Failed(e.to_string());
    }
  };
  let ingestion_id = handle.id;

  // AwaitingVectors
  let outcome = tokio::select! {
    outcome = handle.wait() => outcome,
    _ = cancel.cancelled() => {
      ctx.queue.cancel(ingestion_id);
      set_status(ctx, &file.path, file, parser_version, IndexState::Outdated, None).await;
      return IngestOutcome::Cancelled;
    }
    _ = tokio::time::sleep(ctx.ingestion_timeout) => {
      ctx.queue.cancel(ingestion_id);
      let message = "ingestion timed out".to_string();
      warn!(path, "Ingestion timed out");
      set_status(ctx, &file.path, file, parser_version, IndexState::Failed, Some(message.clone())).await;
      return IngestOutcome::Failed(message);
    }
  };

  match outcome {
    IngestionOutcome::Complete(vectors) => {
      // Committing: replace rows first, then the status record
      let rows = build_rows(&path, file, parser_version, &chunks, vectors);
      if let Err(e) = ctx.db.replace_file(&path, &rows).await {
        let message = e.to_string();
        warn!(path, error = %message, "Commit failed");
        set_status(ctx, &file.path, file, parser_version, IndexState::Failed, Some(message.clone())).await;
        return IngestOutcome::Failed(message);
      }
      commit_status(ctx, &path, file, parser_version, rows.len()).await;
      info!(path, chunks = rows.len(), "Indexed file");
      IngestOutcome::Indexed { chunks: rows.len() }
    }
    IngestionOutcome::Failed(message) => {
      // Prior committed vectors stay untouched
      warn!(path, error = %message, "Embedding failed");
      set_status(ctx, &file.path, file, parser_version, IndexState::Failed, Some(message.clone())).await;
      IngestOutcome::Failed(message)
    }
    IngestionOutcome::Cancelled => {
      set_status(ctx, &file.path, file, parser_version, IndexState::Outdated, None).await;
      IngestOutcome::Cancelled
    }
  }
}

fn build_rows(
  path: &str,
  file: &ScannedFile,
  parser_version: u32,
  chunks: &[Chunk],
  vectors: Vec<Vec<f32>>,
) -> Vec<VectorRow> {
  let indexed_at = Utc::now();
  chunks
    .iter()
    .zip(vectors)
    .map(|(chunk, vector)| VectorRow {
      id: row_id(path, chunk.chunk_index),
      path: path.to_string(),
      chunk_index: chunk.chunk_index,
      offset: chunk.offset,
      text: chunk.text.clone(),
      vector,
      mtime: file.mtime,
      parser_version,
      indexed_at,
    })
    .collect()
}

async fn set_status(
  ctx: &IngestContext,
  path: &std::path::Path,
  file: &ScannedFile,
  parser_version: u32,
  state: IndexState,
  last_error: Option<String>,
) {
  let status = FileStatus {
    path: path.to_string_lossy().to_string(),
    state,
    content_hash: file.content_hash.clone(),
    parser_version,
    chunk_count: 0,
    indexed_at: Utc::now(),
    last_error,
  };

  if let Err(e) = ctx.db.set_file_status(&status).await {
    warn!(path = %path.display(), error = %e, "Failed to update file status");
  }
}

async fn commit_status(ctx: &IngestContext, path: &str, file: &ScannedFile, parser_version: u32, chunk_count: usize) {
  let status = FileStatus {
    path: path.to_string(),
    state: IndexState::Indexed,
    content_hash: file.content_hash.clone(),
    parser_version,
    chunk_count,
    indexed_at: Utc::now(),
    last_error: None,
  };

  if let Err(e) = ctx.db.set_file_status(&status).await {
    warn!(path, error = %e, "Failed to commit file status");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chunker::ChunkerConfig;
  use crate::queue::run_consumer;
  use crate::scanner::Scanner;
  use embedding::MockEmbedder;
  use semadex_core::{Config, QueueConfig};
  use tempfile::TempDir;

  struct Fixture {
    _data_dir: TempDir,
    root: TempDir,
    ctx: IngestContext,
    embedder: Arc<MockEmbedder>,
    scanner: Scanner,
    cancel: CancellationToken,
  }

  async fn fixture() -> Fixture {
    let data_dir = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();

    let db = Arc::new(SearchDb::open(data_dir.path(), 8).await.unwrap());
    let queue = EmbedQueue::new(QueueConfig::default());
    let embedder = Arc::new(MockEmbedder::new(8));
    let cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), cancel.clone()));

    let ctx = IngestContext {
      db,
      queue,
      registry: Arc::new(ParserRegistry::builtin()),
      chunker: Chunker::new(ChunkerConfig::default()),
      failed_retry: Duration::from_secs(24 * 3600),
      ingestion_timeout: Duration::from_secs(10),
    };

    Fixture {
      _data_dir: data_dir,
      root,
      ctx,
      embedder,
      scanner: Scanner::new(&Config::default().watch),
      cancel,
    }
  }

  impl Fixture {
    fn write(&self, name: &str, content: &str) -> ScannedFile {
      let path = self.root.path().join(name);
      std::fs::write(&path, content).unwrap();
      self.scanner.scan_file(&path, &self.ctx.registry).unwrap()
    }
  }

  #[tokio::test]
  async fn test_happy_path() {
    let fx = fixture().await;
    let file = fx.write("a.txt", "hello world. goodbye.");
    let path = file.path.to_string_lossy().to_string();

    let outcome = ingest_file(&fx.ctx, &file, &CancellationToken::new()).await;
    assert_eq!(outcome, IngestOutcome::Indexed { chunks: 1 });

    let status = fx.ctx.db.file_status(&path).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Indexed);
    assert_eq!(status.chunk_count, 1);
    assert_eq!(status.content_hash, file.content_hash);
    assert!(status.last_error.is_none());

    let rows = fx.ctx.db.rows_for_path(&path).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].chunk_index, 0);
    assert_eq!(rows[0].offset, 0);
    assert_eq!(rows[0].text, "hello world. goodbye.");
    fx.cancel.cancel();
  }

  #[tokio::test]
  async fn test_unchanged_file_is_skipped() {
    let fx = fixture().await;
    let file = fx.write("a.txt", "hello world. goodbye.");

    assert_eq!(
      ingest_file(&fx.ctx, &file, &CancellationToken::new()).await,
      IngestOutcome::Indexed { chunks: 1 }
    );
    assert_eq!(
      ingest_file(&fx.ctx, &file, &CancellationToken::new()).await,
      IngestOutcome::Skipped
    );
    fx.cancel.cancel();
  }

  #[tokio::test]
  async fn test_content_change_replaces_rows() {
    let fx = fixture().await;
    let file = fx.write("a.txt", "hello world. goodbye.");
    let path = file.path.to_string_lossy().to_string();
    ingest_file(&fx.ctx, &file, &CancellationToken::new()).await;

    let changed = fx.write("a.txt", "hello world. see you later.");
    assert_ne!(file.content_hash, changed.content_hash);

    let outcome = ingest_file(&fx.ctx, &changed, &CancellationToken::new()).await;
    assert_eq!(outcome, IngestOutcome::Indexed { chunks: 1 });

    let rows = fx.ctx.db.rows_for_path(&path).await.unwrap();
    assert_eq!(rows.len(), 1, "old row replaced, not duplicated");
    assert_eq!(rows[0].text, "hello world. see you later.");
    fx.cancel.cancel();
  }

  #[tokio::test]
  async fn test_empty_file_indexed_with_zero_chunks() {
    let fx = fixture().await;
    let file = fx.write("empty.txt", "");
    let path = file.path.to_string_lossy().to_string();

    let outcome = ingest_file(&fx.ctx, &file, &CancellationToken::new()).await;
    assert_eq!(outcome, IngestOutcome::Indexed { chunks: 0 });

    let status = fx.ctx.db.file_status(&path).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Indexed);
    assert_eq!(status.chunk_count, 0);
    assert!(fx.ctx.db.rows_for_path(&path).await.unwrap().is_empty());
    fx.cancel.cancel();
  }

  #[tokio::test]
  async fn test_corrupted_file_marked_failed() {
    let fx = fixture().await;
    let path = fx.root.path().join("bad.txt");
    std::fs::write(&path, [0u8, 159, 146, 150]).unwrap();
    let file = fx.scanner.scan_file(&path, &fx.ctx.registry).unwrap();

    let outcome = ingest_file(&fx.ctx, &file, &CancellationToken::new()).await;
    assert!(matches!(outcome, IngestOutcome::Failed(_)));

    let status = fx
      .ctx
      .db
      .file_status(&path.to_string_lossy())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(status.state, IndexState::Failed);
    assert!(status.last_error.unwrap().contains("corrupted"));
    fx.cancel.cancel();
  }

  #[tokio::test]
  async fn test_embed_failure_keeps_previous_index() {
    let fx = fixture().await;
    let file = fx.write("a.txt", "hello world. goodbye.");
    let path = file.path.to_string_lossy().to_string();
    ingest_file(&fx.ctx, &file, &CancellationToken::new()).await;

    let changed = fx.write("a.txt", "totally new content here.");
    fx.embedder.fail_next(1);

    let outcome = ingest_file(&fx.ctx, &changed, &CancellationToken::new()).await;
    assert!(matches!(outcome, IngestOutcome::Failed(_)));

    // Old vectors survive an embed failure
    let rows = fx.ctx.db.rows_for_path(&path).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].text, "hello world. goodbye.");

    let status = fx.ctx.db.file_status(&path).await.unwrap().unwrap();
    assert_eq!(status.state, IndexState::Failed);
    fx.cancel.cancel();
  }

  #[tokio::test]
  async fn test_reindex_idempotence() {
    let fx = fixture().await;
    let file = fx.write("a.txt", "first sentence here. second sentence there.");
    let path = file.path.to_string_lossy().to_string();

    ingest_file(&fx.ctx, &file, &CancellationToken::new()).await;
    let first: Vec<_> = fx.ctx.db.rows_for_path(&path).await.unwrap();

    // Force a re-index of identical content
    let mut status = fx.ctx.db.file_status(&path).await.unwrap().unwrap();
    status.state = IndexState::Outdated;
    fx.ctx.db.set_file_status(&status).await.unwrap();

    ingest_file(&fx.ctx, &file, &CancellationToken::new()).await;
    let second: Vec<_> = fx.ctx.db.rows_for_path(&path).await.unwrap();

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
      assert_eq!(a.id, b.id);
      assert_eq!(a.text, b.text);
      assert_eq!(a.offset, b.offset);
      assert_eq!(a.vector, b.vector);
      assert_eq!(a.parser_version, b.parser_version);
      // indexed_at may differ
    }
    fx.cancel.cancel();
  }

  #[test]
  fn test_needs_index_predicate() {
    let file = ScannedFile {
      path: "/a.txt".into(),
      extension: "txt".into(),
      size: 10,
      mtime: 0,
      content_hash: "hash1".into(),
    };
    let retry = Duration::from_secs(24 * 3600);

    // No record
    assert!(needs_index(None, &file, 1, retry));

    let indexed = FileStatus {
      path: "/a.txt".into(),
      state: IndexState::Indexed,
      content_hash: "hash1".into(),
      parser_version: 1,
      chunk_count: 1,
      indexed_at: Utc::now(),
      last_error: None,
    };

    // Up to date
    assert!(!needs_index(Some(&indexed), &file, 1, retry));

    // Hash change
    let mut changed = indexed.clone();
    changed.content_hash = "hash0".into();
    assert!(needs_index(Some(&changed), &file, 1, retry));

    // Parser upgrade
    assert!(needs_index(Some(&indexed), &file, 2, retry));

    // Outdated
    let mut outdated = indexed.clone();
    outdated.state = IndexState::Outdated;
    assert!(needs_index(Some(&outdated), &file, 1, retry));

    // Fresh failure: not yet eligible
    let mut failed = indexed.clone();
    failed.state = IndexState::Failed;
    assert!(!needs_index(Some(&failed), &file, 1, retry));

    // Aged failure
    let mut old_failure = failed.clone();
    old_failure.indexed_at = Utc::now() - TimeDelta::hours(25);
    assert!(needs_index(Some(&old_failure), &file, 1, retry));

    // Failure retried early when the parser advances
    assert!(needs_index(Some(&failed), &file, 2, retry));
  }
}
