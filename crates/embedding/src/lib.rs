pub mod http;
mod lane;
pub mod mock;
pub mod retry;
pub mod service;

use async_trait::async_trait;

pub use http::HttpEmbedder;
pub use mock::MockEmbedder;
pub use retry::{RetryConfig, is_retryable};
pub use service::{EmbedService, ServiceConfig, ServiceState};

/// Whether a text is being embedded for storage or for retrieval.
///
/// Queries ride a priority lane: they are inserted ahead of queued document
/// batches but never interrupt a batch already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedKind {
  #[default]
  Document,
  Query,
}

/// The embed capability consumed by the indexing pipeline and the search
/// path. Implemented by the supervised service and by the deterministic mock.
#[async_trait]
pub trait Embedder: Send + Sync {
  fn dimensions(&self) -> usize;

  /// Embed a batch of document chunks, one vector per input in order.
  async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

  /// Embed a search query on the priority lane.
  async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

  /// Cheap liveness signal; false while the service is in its error state.
  async fn health(&self) -> bool;

  /// Graceful stop with bounded wait, then forceful termination.
  async fn shutdown(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  #[error("embedding service unavailable")]
  ServiceUnavailable,

  #[error("embedding request timed out")]
  Timeout,

  /// Malformed response from the server. Reported, never retried.
  #[error("protocol error: {0}")]
  Protocol(String),

  /// Server-side error response. Retried for 5xx/429.
  #[error("server returned {status}: {message}")]
  Server { status: u16, message: String },

  /// The model returned vectors of the wrong dimension. Fatal: indicates
  /// model/config skew and must never be written to the store.
  #[error("dimension mismatch: got {got}, expected {expected}")]
  DimensionMismatch { got: usize, expected: usize },

  #[error("batch exceeds server limits")]
  OversizedBatch,

  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error("failed to spawn embedding server: {0}")]
  Spawn(#[source] std::io::Error),
}
