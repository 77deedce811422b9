//! Search service.
//!
//! Embeds the query on the priority lane, fetches more raw hits than
//! requested, groups them by path, orders groups by their best hit and
//! keeps the top k groups. Safe to call while indexing runs; an embedding
//! outage fails fast instead of queueing behind document batches.

use db::{DbError, SearchDb};
use embedding::{Embedder, EmbeddingError};
use semadex_core::Hit;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SearchError {
  #[error("embedding error: {0}")]
  Embedding(#[from] EmbeddingError),
  #[error("store error: {0}")]
  Store(#[from] DbError),
}

/// Hits for one file, best first.
#[derive(Debug, Clone, Serialize)]
pub struct GroupedResult {
  pub path: String,
  pub top_hit: Hit,
  pub hits: Vec<Hit>,
}

pub struct SearchService {
  embedder: Arc<dyn Embedder>,
  db: Arc<SearchDb>,
  grouping_factor: usize,
}

impl SearchService {
  pub fn new(embedder: Arc<dyn Embedder>, db: Arc<SearchDb>, grouping_factor: usize) -> Self {
    Self {
      embedder,
      db,
      grouping_factor: grouping_factor.max(1),
    }
  }

  /// Top `k` file groups for a query.
  pub async fn search(&self, query: &str, k: usize) -> Result<Vec<GroupedResult>, SearchError> {
    let query_vector = self.embedder.embed_query(query).await?;
    let raw = self.db.search(&query_vector, k.max(1) * self.grouping_factor).await?;

    debug!(query, raw_hits = raw.len(), "Grouping search hits");
    Ok(group_hits(raw, k))
  }
}

/// Group hits by path, order groups by top hit score, keep the top k.
fn group_hits(raw: Vec<Hit>, k: usize) -> Vec<GroupedResult> {
  let mut order: Vec<String> = Vec::new();
  let mut by_path: HashMap<String, Vec<Hit>> = HashMap::new();

  for hit in raw {
    if !by_path.contains_key(&hit.path) {
      order.push(hit.path.clone());
    }
    by_path.entry(hit.path.clone()).or_default().push(hit);
  }

  let mut groups: Vec<GroupedResult> = order
    .into_iter()
    .map(|path| {
      let mut hits = by_path.remove(&path).unwrap_or_default();
      hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
      GroupedResult {
        path,
        top_hit: hits[0].clone(),
        hits,
      }
    })
    .collect();

  groups.sort_by(|a, b| {
    b.top_hit
      .score
      .partial_cmp(&a.top_hit.score)
      .unwrap_or(std::cmp::Ordering::Equal)
  });
  groups.truncate(k);
  groups
}
