//! Bounded embedding queue.
//!
//! Producer ingestions append chunks; a single consumer drains them into the
//! embedding service in greedy batches bounded by a text count and a token
//! estimate. Completion is tracked per ingestion in an arena keyed by
//! ingestion id, so batches may freely mix chunks from different files.
//!
//! Backpressure: a watch channel flips when the queue depth crosses the
//! high-water mark in either direction. Admission blocks (bounded wait) when
//! the hard cap is reached.

use dashmap::DashMap;
use embedding::Embedder;
use semadex_core::{Chunk, IngestionId, QueueConfig, estimate_tokens};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Error, Debug)]
pub enum QueueError {
  #[error("queue is shutting down")]
  ShuttingDown,
}

/// A chunk owned by the queue until dispatched.
#[derive(Debug)]
pub struct QueuedChunk {
  pub ingestion_id: IngestionId,
  pub chunk_index: usize,
  pub text: String,
  pub tokens: usize,
}

/// Terminal result of one ingestion.
#[derive(Debug)]
pub enum IngestionOutcome {
  /// Vectors in chunk_index order, one per chunk
  Complete(Vec<Vec<f32>>),
  Failed(String),
  Cancelled,
}

/// Handle returned by `add_chunks`; resolves exactly once when every chunk
/// of the ingestion has produced a vector or failed.
pub struct IngestionHandle {
  pub id: IngestionId,
  rx: oneshot::Receiver<IngestionOutcome>,
}

impl IngestionHandle {
  pub async fn wait(self) -> IngestionOutcome {
    self
      .rx
      .await
      .unwrap_or_else(|_| IngestionOutcome::Failed("queue shut down".to_string()))
  }
}

struct IngestionEntry {
  total: usize,
  done: usize,
  vectors: Vec<Option<Vec<f32>>>,
  error: Option<String>,
  cancelled: bool,
  respond: Option<oneshot::Sender<IngestionOutcome>>,
}

pub struct EmbedQueue {
  config: QueueConfig,
  queue: Mutex<VecDeque<QueuedChunk>>,
  depth: AtomicUsize,
  arena: DashMap<IngestionId, IngestionEntry>,
  next_id: AtomicU64,
  backpressure_tx: watch::Sender<bool>,
  work: Notify,
  space: Notify,
  closed: AtomicBool,
}

impl EmbedQueue {
  pub fn new(config: QueueConfig) -> Arc<Self> {
    let (backpressure_tx, _) = watch::channel(false);
    Arc::new(Self {
      config,
      queue: Mutex::new(VecDeque::new()),
      depth: AtomicUsize::new(0),
      arena: DashMap::new(),
      next_id: AtomicU64::new(0),
      backpressure_tx,
      work: Notify::new(),
      space: Notify::new(),
      closed: AtomicBool::new(false),
    })
  }

  /// Current number of queued chunks.
  pub fn depth(&self) -> usize {
    self.depth.load(Ordering::Relaxed)
  }

  /// Observe backpressure transitions. True while the queue depth is at or
  /// above the high-water mark.
  pub fn subscribe_backpressure(&self) -> watch::Receiver<bool> {
    self.backpressure_tx.subscribe()
  }

  /// Atomically append all chunks of one ingestion, waiting while the queue
  /// is at its hard cap. Returns a handle that resolves when the ingestion
  /// completes.
  pub async fn add_chunks(&self, path: &str, chunks: &[Chunk]) -> Result<IngestionHandle, QueueError> {
    assert!(!chunks.is_empty(), "empty ingestions never enter the queue");

    let id = IngestionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
    let (respond, rx) = oneshot::channel();

    self.arena.insert(
      id,
      IngestionEntry {
        total: chunks.len(),
        done: 0,
        vectors: vec![None; chunks.len()],
        error: None,
        cancelled: false,
        respond: Some(respond),
      },
    );

    let n = chunks.len();
    loop {
      // Register for space before checking so a concurrent drain is not missed
      let space = self.space.notified();

      if self.closed.load(Ordering::SeqCst) {
        self.arena.remove(&id);
        return Err(QueueError::ShuttingDown);
      }

      {
        let mut queue = self.queue.lock().await;
        let depth = queue.len();
        // A file with more chunks than the whole cap is admitted alone
        if depth + n <= self.config.max_queue_size || depth == 0 {
          for chunk in chunks {
            queue.push_back(QueuedChunk {
              ingestion_id: id,
              chunk_index: chunk.chunk_index,
              tokens: estimate_tokens(&chunk.text),
              text: chunk.text.clone(),
            });
          }
          self.depth.store(queue.len(), Ordering::Relaxed);
          drop(queue);

          self.update_backpressure();
          self.work.notify_one();
          trace!(path, ingestion = %id, chunks = n, "Enqueued ingestion");
          return Ok(IngestionHandle { id, rx });
        }
      }

      space.await;
    }
  }

  /// Mark an ingestion cancelled. Its queued chunks are dropped after the
  /// batch currently in flight completes; the handle resolves `Cancelled`.
  pub fn cancel(&self, id: IngestionId) {
    if let Some(mut entry) = self.arena.get_mut(&id) {
      entry.cancelled = true;
      debug!(ingestion = %id, "Ingestion cancelled");
    }
    self.work.notify_one();
  }

  /// Refuse further admissions and wake blocked producers.
  pub fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
    self.space.notify_waiters();
    self.work.notify_waiters();
  }

  fn update_backpressure(&self) {
    let asserted = self.depth() >= self.config.backpressure_threshold;
    self.backpressure_tx.send_if_modified(|current| {
      if *current != asserted {
        debug!(asserted, depth = self.depth(), "Backpressure changed");
        *current = asserted;
        true
      } else {
        false
      }
    });
  }

  /// Pop the next greedy batch: FIFO until the next chunk would exceed the
  /// count cap or the token cap. Chunks of cancelled ingestions are dropped
  /// here and accounted as done.
  async fn take_batch(&self) -> Vec<QueuedChunk> {
    let mut resolved = Vec::new();
    let batch = {
      let mut queue = self.queue.lock().await;
      let mut batch: Vec<QueuedChunk> = Vec::new();
      let mut tokens = 0usize;

      while let Some(front) = queue.front() {
        let cancelled = self
          .arena
          .get(&front.ingestion_id)
          .map(|e| e.cancelled)
          .unwrap_or(true);

        if cancelled {
          let chunk = queue.pop_front().expect("front exists");
          if let Some(id) = self.account_dropped(&chunk) {
            resolved.push(id);
          }
          continue;
        }

        let fits = batch.is_empty()
          || (batch.len() < self.config.batch_size && tokens + front.tokens <= self.config.batch_token_cap);
        if !fits {
          break;
        }

        let chunk = queue.pop_front().expect("front exists");
        tokens += chunk.tokens;
        batch.push(chunk);
      }

      self.depth.store(queue.len(), Ordering::Relaxed);
      batch
    };

    for id in resolved {
      self.resolve(id);
    }
    self.update_backpressure();
    self.space.notify_waiters();
    batch
  }

  /// Account a dropped (cancelled) chunk; returns the id when the ingestion
  /// just finished.
  fn account_dropped(&self, chunk: &QueuedChunk) -> Option<IngestionId> {
    let mut entry = self.arena.get_mut(&chunk.ingestion_id)?;
    entry.done += 1;
    (entry.done >= entry.total).then_some(chunk.ingestion_id)
  }

  fn record_vector(&self, id: IngestionId, chunk_index: usize, vector: Vec<f32>) {
    let finished = {
      let Some(mut entry) = self.arena.get_mut(&id) else {
        return;
      };
      if let Some(slot) = entry.vectors.get_mut(chunk_index) {
        *slot = Some(vector);
      }
      entry.done += 1;
      entry.done >= entry.total
    };

    if finished {
      self.resolve(id);
    }
  }

  fn record_failure(&self, id: IngestionId, message: &str) {
    let finished = {
      let Some(mut entry) = self.arena.get_mut(&id) else {
        return;
      };
      if entry.error.is_none() {
        entry.error = Some(message.to_string());
      }
      entry.done += 1;
      entry.done >= entry.total
    };

    if finished {
      self.resolve(id);
    }
  }

  /// Resolve an ingestion's completion handle exactly once.
  fn resolve(&self, id: IngestionId) {
    let Some((_, mut entry)) = self.arena.remove(&id) else {
      return;
    };

    let outcome = if entry.cancelled {
      IngestionOutcome::Cancelled
    } else if let Some(error) = entry.error.take() {
      IngestionOutcome::Failed(error)
    } else {
      let mut vectors = Vec::with_capacity(entry.total);
      let mut complete = true;
      for slot in entry.vectors.drain(..) {
        match slot {
          Some(v) => vectors.push(v),
          None => {
            complete = false;
            break;
          }
        }
      }
      if complete {
        IngestionOutcome::Complete(vectors)
      } else {
        IngestionOutcome::Failed("ingestion finished with missing vectors".to_string())
      }
    };

    if let Some(respond) = entry.respond.take() {
      let _ = respond.send(outcome);
    }
  }
}

/// Single-consumer loop: drain batches into the embedder until cancelled.
///
/// The embedder handles its own retries and restarts; a batch error here is
/// final and fails every chunk in the batch.
pub async fn run_consumer(queue: Arc<EmbedQueue>, embedder: Arc<dyn Embedder>, cancel: CancellationToken) {
  debug!(
    batch_size = queue.config.batch_size,
    token_cap = queue.config.batch_token_cap,
    "Embedding queue consumer starting"
  );

  loop {
    let batch = loop {
      if cancel.is_cancelled() {
        debug!("Embedding queue consumer cancelled");
        return;
      }

      let batch = queue.take_batch().await;
      if !batch.is_empty() {
        break batch;
      }

      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          debug!("Embedding queue consumer cancelled");
          return;
        }
        _ = queue.work.notified() => {}
      }
    };

    let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
    trace!(chunks = batch.len(), "Dispatching embedding batch");

    match embedder.embed_documents(&texts).await {
      Ok(vectors) => {
        for (chunk, vector) in batch.into_iter().zip(vectors) {
          queue.record_vector(chunk.ingestion_id, chunk.chunk_index, vector);
        }
      }
      Err(e) => {
        let message = e.to_string();
        warn!(chunks = batch.len(), error = %message, "Embedding batch failed");
        for chunk in &batch {
          queue.record_failure(chunk.ingestion_id, &message);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use embedding::MockEmbedder;
  use std::time::Duration;

  fn make_chunks(n: usize) -> Vec<Chunk> {
    (0..n)
      .map(|i| Chunk {
        chunk_index: i,
        offset: i * 10,
        text: format!("chunk number {i}"),
      })
      .collect()
  }

  fn test_queue(max: usize, threshold: usize, batch: usize) -> Arc<EmbedQueue> {
    EmbedQueue::new(QueueConfig {
      max_queue_size: max,
      backpressure_threshold: threshold,
      batch_size: batch,
      batch_token_cap: 7000,
    })
  }

  #[tokio::test]
  async fn test_completion_in_chunk_order() {
    let queue = test_queue(100, 50, 4);
    let embedder = Arc::new(MockEmbedder::new(8));
    let cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), cancel.clone()));

    let chunks = make_chunks(10);
    let handle = queue.add_chunks("/a.txt", &chunks).await.unwrap();

    match handle.wait().await {
      IngestionOutcome::Complete(vectors) => {
        assert_eq!(vectors.len(), 10);
        for (i, vector) in vectors.iter().enumerate() {
          assert_eq!(vector, &embedder.vector_for(&format!("chunk number {i}")));
        }
      }
      other => panic!("expected completion, got {other:?}"),
    }

    cancel.cancel();
  }

  #[tokio::test]
  async fn test_batches_respect_count_cap() {
    let queue = test_queue(100, 50, 3);
    let embedder = Arc::new(MockEmbedder::new(8));
    let cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), cancel.clone()));

    let handle = queue.add_chunks("/a.txt", &make_chunks(7)).await.unwrap();
    handle.wait().await;

    // 7 chunks at batch_size 3: at least 3 batches
    assert!(embedder.batches() >= 3);
    assert_eq!(embedder.texts_embedded(), 7);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_token_cap_limits_batches() {
    let queue = EmbedQueue::new(QueueConfig {
      max_queue_size: 100,
      backpressure_threshold: 50,
      batch_size: 32,
      batch_token_cap: 8,
    });
    let embedder = Arc::new(MockEmbedder::new(8));
    let cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), cancel.clone()));

    // Each chunk estimates to ~6 tokens, so only one fits per batch
    let handle = queue.add_chunks("/a.txt", &make_chunks(3)).await.unwrap();
    handle.wait().await;

    assert_eq!(embedder.batches(), 3);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_failed_batch_fails_ingestion() {
    let queue = test_queue(100, 50, 32);
    let embedder = Arc::new(MockEmbedder::new(8));
    embedder.fail_next(1);
    let cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), cancel.clone()));

    let handle = queue.add_chunks("/a.txt", &make_chunks(3)).await.unwrap();
    match handle.wait().await {
      IngestionOutcome::Failed(message) => assert!(message.contains("unavailable")),
      other => panic!("expected failure, got {other:?}"),
    }
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_serial_dispatch() {
    let queue = test_queue(100, 50, 2);
    let embedder = Arc::new(MockEmbedder::new(8).with_delay(Duration::from_millis(5)));
    let cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), cancel.clone()));

    let h1 = queue.add_chunks("/a.txt", &make_chunks(4)).await.unwrap();
    let h2 = queue.add_chunks("/b.txt", &make_chunks(4)).await.unwrap();
    h1.wait().await;
    h2.wait().await;

    // The single consumer never overlaps requests
    assert_eq!(embedder.max_in_flight(), 1);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_backpressure_flips_both_directions() {
    let queue = test_queue(100, 5, 32);
    let mut backpressure = queue.subscribe_backpressure();
    assert!(!*backpressure.borrow());

    // No consumer yet: fill past the threshold
    let handle = queue.add_chunks("/a.txt", &make_chunks(6)).await.unwrap();
    backpressure.changed().await.unwrap();
    assert!(*backpressure.borrow());

    // Start the consumer and drain
    let embedder = Arc::new(MockEmbedder::new(8));
    let cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder, cancel.clone()));
    handle.wait().await;

    backpressure.changed().await.unwrap();
    assert!(!*backpressure.borrow());
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_hard_cap_blocks_admission() {
    let queue = test_queue(4, 2, 32);

    // Fills the queue completely
    let h1 = queue.add_chunks("/a.txt", &make_chunks(4)).await.unwrap();

    // Next admission must block until a consumer drains
    let queue2 = queue.clone();
    let chunks = make_chunks(2);
    let blocked = tokio::spawn(async move { queue2.add_chunks("/b.txt", &chunks).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished(), "admission should block at hard cap");

    let embedder = Arc::new(MockEmbedder::new(8));
    let cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder, cancel.clone()));

    let h2 = blocked.await.unwrap().unwrap();
    h1.wait().await;
    h2.wait().await;
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_queue_bound_invariant() {
    let queue = test_queue(8, 4, 4);
    assert_eq!(queue.depth(), 0);

    let _h = queue.add_chunks("/a.txt", &make_chunks(8)).await.unwrap();
    assert!(queue.depth() <= 8);
  }

  #[tokio::test]
  async fn test_cancelled_ingestion_resolves_cancelled() {
    let queue = test_queue(100, 50, 32);

    let handle = queue.add_chunks("/a.txt", &make_chunks(3)).await.unwrap();
    queue.cancel(handle.id);

    // Consumer drops the cancelled chunks instead of embedding them
    let embedder = Arc::new(MockEmbedder::new(8));
    let cancel = CancellationToken::new();
    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), cancel.clone()));

    match handle.wait().await {
      IngestionOutcome::Cancelled => {}
      other => panic!("expected cancelled, got {other:?}"),
    }
    assert_eq!(embedder.texts_embedded(), 0);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_closed_queue_rejects_admission() {
    let queue = test_queue(100, 50, 32);
    queue.close();

    let err = queue.add_chunks("/a.txt", &make_chunks(1)).await.unwrap_err();
    assert!(matches!(err, QueueError::ShuttingDown));
  }

  #[tokio::test]
  async fn test_batches_mix_files() {
    let queue = test_queue(100, 50, 32);
    let embedder = Arc::new(MockEmbedder::new(8));
    let cancel = CancellationToken::new();

    let h1 = queue.add_chunks("/a.txt", &make_chunks(2)).await.unwrap();
    let h2 = queue.add_chunks("/b.txt", &make_chunks(2)).await.unwrap();

    tokio::spawn(run_consumer(queue.clone(), embedder.clone(), cancel.clone()));
    h1.wait().await;
    h2.wait().await;

    // All four chunks fit one batch
    assert_eq!(embedder.batches(), 1);
    assert_eq!(embedder.texts_embedded(), 4);
    cancel.cancel();
  }
}
