//! Deterministic in-process embedder for tests.
//!
//! Produces stable, L2-normalized vectors derived from the text content so
//! identical texts embed identically across runs. Supports failure injection
//! and records concurrency so tests can assert the serial-lane property.

use crate::{Embedder, EmbeddingError};
use async_trait::async_trait;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct MockEmbedder {
  dimensions: usize,
  delay: Option<Duration>,
  fail_remaining: AtomicU32,
  healthy: AtomicBool,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
  batches: AtomicUsize,
  texts_embedded: AtomicUsize,
}

impl MockEmbedder {
  pub fn new(dimensions: usize) -> Self {
    Self {
      dimensions,
      delay: None,
      fail_remaining: AtomicU32::new(0),
      healthy: AtomicBool::new(true),
      in_flight: AtomicUsize::new(0),
      max_in_flight: AtomicUsize::new(0),
      batches: AtomicUsize::new(0),
      texts_embedded: AtomicUsize::new(0),
    }
  }

  /// Add a per-call delay so tests can observe in-flight behavior.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// Fail the next `n` embed calls with `ServiceUnavailable`.
  pub fn fail_next(&self, n: u32) {
    self.fail_remaining.store(n, Ordering::SeqCst);
  }

  pub fn set_healthy(&self, healthy: bool) {
    self.healthy.store(healthy, Ordering::SeqCst);
  }

  /// Highest number of concurrently running embed calls observed.
  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }

  pub fn batches(&self) -> usize {
    self.batches.load(Ordering::SeqCst)
  }

  pub fn texts_embedded(&self) -> usize {
    self.texts_embedded.load(Ordering::SeqCst)
  }

  /// Stable unit-length vector for a text.
  pub fn vector_for(&self, text: &str) -> Vec<f32> {
    let mut vector = Vec::with_capacity(self.dimensions);
    for i in 0..self.dimensions {
      let mut hasher = std::hash::DefaultHasher::new();
      text.hash(&mut hasher);
      i.hash(&mut hasher);
      let raw = hasher.finish();
      // Map onto [-1, 1]
      vector.push((raw as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32);
    }

    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
      for v in &mut vector {
        *v /= norm;
      }
    }
    vector
  }

  async fn run_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(current, Ordering::SeqCst);

    let result = async {
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }

      if self
        .fail_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
      {
        return Err(EmbeddingError::ServiceUnavailable);
      }

      self.batches.fetch_add(1, Ordering::SeqCst);
      self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
      Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
    .await;

    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    result
  }
}

#[async_trait]
impl Embedder for MockEmbedder {
  fn dimensions(&self) -> usize {
    self.dimensions
  }

  async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    self.run_batch(texts).await
  }

  async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let vectors = self.run_batch(std::slice::from_ref(&text.to_string())).await?;
    Ok(vectors.into_iter().next().unwrap_or_default())
  }

  async fn health(&self) -> bool {
    self.healthy.load(Ordering::SeqCst)
  }

  async fn shutdown(&self) {}
}
