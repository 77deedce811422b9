//! Retry policy for embedding requests.

use crate::EmbeddingError;
use std::time::Duration;

/// How failed requests are retried: a bounded number of attempts with a
/// delay that doubles each time, capped, and smeared with jitter so
/// concurrent callers do not hammer a recovering server in lockstep.
#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 2,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(30),
      jitter: true,
    }
  }
}

impl RetryConfig {
  /// Delay before retry `attempt` (0-based): the base delay doubled per
  /// attempt, capped at `max_delay`, plus up to a quarter of itself as
  /// jitter.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let doubled = self.base_delay.saturating_mul(1u32 << attempt.min(16));
    let mut delay = doubled.min(self.max_delay);

    if self.jitter {
      delay += delay.mul_f64(jitter_fraction() * 0.25);
      delay = delay.min(self.max_delay);
    }

    delay
  }
}

/// Cheap jitter source: the clock's sub-millisecond noise mapped to [0, 1).
fn jitter_fraction() -> f64 {
  let nanos = std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.subsec_nanos())
    .unwrap_or(0);

  f64::from(nanos % 1_000_000) / 1_000_000.0
}

/// Whether a failed request is worth retrying. Transport failures,
/// timeouts and throttling/5xx responses are transient; everything else
/// (malformed responses, dimension skew, oversized batches) will fail the
/// same way again.
pub fn is_retryable(error: &EmbeddingError) -> bool {
  match error {
    EmbeddingError::Timeout => true,
    EmbeddingError::Request(_) => true,
    EmbeddingError::Server { status, .. } => *status == 429 || *status >= 500,
    _ => false,
  }
}
