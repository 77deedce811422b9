//! HTTP transport for the embedding server wire protocol.
//!
//! The server exposes two routes on a loopback endpoint:
//! - `GET /health` → `{"status": "ok"}` when ready
//! - `POST /embed {texts, normalize, pooling}` → `{"vectors": [[f32]]}`
//!
//! The transport validates the returned shape (one vector per input, every
//! vector of the configured dimension) and maps error responses onto the
//! embedding error taxonomy. It knows nothing about processes, retries or
//! lanes.

use crate::EmbeddingError;
use semadex_core::Pooling;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpEmbedder {
  client: reqwest::Client,
  base_url: String,
  dimensions: usize,
  normalize: bool,
  pooling: Pooling,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
  texts: &'a [String],
  normalize: bool,
  pooling: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
  vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
  error: String,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
  status: String,
}

impl HttpEmbedder {
  pub fn new(base_url: impl Into<String>, dimensions: usize, normalize: bool, pooling: Pooling) -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url: base_url.into().trim_end_matches('/').to_string(),
      dimensions,
      normalize,
      pooling,
    }
  }

  pub fn dimensions(&self) -> usize {
    self.dimensions
  }

  fn embed_url(&self) -> String {
    format!("{}/embed", self.base_url)
  }

  fn health_url(&self) -> String {
    format!("{}/health", self.base_url)
  }

  /// Check whether the server answers its health route affirmatively.
  pub async fn health(&self) -> bool {
    match self
      .client
      .get(self.health_url())
      .timeout(std::time::Duration::from_secs(5))
      .send()
      .await
    {
      Ok(response) if response.status().is_success() => response
        .json::<HealthResponse>()
        .await
        .map(|h| h.status == "ok")
        .unwrap_or(false),
      _ => false,
    }
  }

  /// Issue one embed request and validate the returned shape.
  pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let request = EmbedRequest {
      texts,
      normalize: self.normalize,
      pooling: self.pooling.as_str(),
    };

    debug!(texts = texts.len(), "Sending embed request");

    let response = self.client.post(self.embed_url()).json(&request).send().await?;

    let status = response.status();
    if !status.is_success() {
      let message = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| status.to_string());

      if status.as_u16() == 413 {
        warn!(texts = texts.len(), "Server rejected batch as oversized");
        return Err(EmbeddingError::OversizedBatch);
      }

      warn!(status = status.as_u16(), message = %message, "Embed request failed");
      return Err(EmbeddingError::Server {
        status: status.as_u16(),
        message,
      });
    }

    let body: EmbedResponse = response
      .json()
      .await
      .map_err(|e| EmbeddingError::Protocol(format!("invalid embed response: {e}")))?;

    if body.vectors.len() != texts.len() {
      return Err(EmbeddingError::Protocol(format!(
        "expected {} vectors, got {}",
        texts.len(),
        body.vectors.len()
      )));
    }

    for vector in &body.vectors {
      if vector.len() != self.dimensions {
        return Err(EmbeddingError::DimensionMismatch {
          got: vector.len(),
          expected: self.dimensions,
        });
      }
    }

    Ok(body.vectors)
  }
}
