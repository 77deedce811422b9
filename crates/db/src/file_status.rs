//! File status store.
//!
//! One persistent record per path. The on-disk table is the source of
//! truth; the in-memory cache is a read accelerator refreshed on every
//! write, so a `get` immediately after a `set` never needs a flush.

use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use semadex_core::{FileStatus, IndexState};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::connection::{DbError, Result, SearchDb, escape_literal};
use crate::schema::file_status_schema;

impl SearchDb {
  /// Look up the status for a path, preferring the cache.
  pub async fn file_status(&self, path: &str) -> Result<Option<FileStatus>> {
    if let Ok(cache) = self.status_cache.read()
      && let Some(status) = cache.get(path)
    {
      return Ok(Some(status.clone()));
    }

    let table = self.file_status_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("path = '{}'", escape_literal(path)))
      .execute()
      .await?
      .try_collect()
      .await?;

    for batch in &results {
      if batch.num_rows() > 0 {
        let status = batch_to_status(batch, 0)?;
        if let Ok(mut cache) = self.status_cache.write() {
          cache.insert(status.path.clone(), status.clone());
        }
        return Ok(Some(status));
      }
    }

    Ok(None)
  }

  /// Upsert the status record for a path.
  pub async fn set_file_status(&self, status: &FileStatus) -> Result<()> {
    let _guard = self.write_lane.lock().await;
    let table = self.file_status_table().await?;

    table
      .delete(&format!("path = '{}'", escape_literal(&status.path)))
      .await?;

    let batch = status_to_batch(status)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], file_status_schema());
    table.add(Box::new(batches)).execute().await?;

    if let Ok(mut cache) = self.status_cache.write() {
      cache.insert(status.path.clone(), status.clone());
    }

    trace!(path = %status.path, state = %status.state, "Updated file status");
    Ok(())
  }

  /// Remove the status record for a path.
  pub async fn delete_file_status(&self, path: &str) -> Result<()> {
    let _guard = self.write_lane.lock().await;
    let table = self.file_status_table().await?;
    table.delete(&format!("path = '{}'", escape_literal(path))).await?;

    if let Ok(mut cache) = self.status_cache.write() {
      cache.remove(path);
    }

    debug!(path, "Deleted file status");
    Ok(())
  }

  /// All records currently in a given state.
  pub async fn statuses_by_state(&self, state: IndexState) -> Result<Vec<FileStatus>> {
    let table = self.file_status_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("state = '{}'", state.as_str()))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut statuses = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        statuses.push(batch_to_status(&batch, i)?);
      }
    }
    Ok(statuses)
  }

  /// Load every record into the cache and return a snapshot.
  pub async fn bulk_load_status_cache(&self) -> Result<HashMap<String, FileStatus>> {
    let statuses = self.all_statuses().await?;

    let map: HashMap<String, FileStatus> = statuses.into_iter().map(|s| (s.path.clone(), s)).collect();
    if let Ok(mut cache) = self.status_cache.write() {
      *cache = map.clone();
    }

    debug!(entries = map.len(), "Loaded file status cache");
    Ok(map)
  }

  /// Every status record in the store.
  pub async fn all_statuses(&self) -> Result<Vec<FileStatus>> {
    let table = self.file_status_table().await?;
    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut statuses = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        statuses.push(batch_to_status(&batch, i)?);
      }
    }
    Ok(statuses)
  }

  /// Counts per state, served from the cache.
  pub fn status_counts(&self) -> HashMap<IndexState, usize> {
    let mut counts = HashMap::new();
    if let Ok(cache) = self.status_cache.read() {
      for status in cache.values() {
        *counts.entry(status.state).or_insert(0) += 1;
      }
    }
    counts
  }

  /// Mark every record `Outdated`. Used by the destructive migration and
  /// parser-version reconciliation. Returns the number of records touched.
  pub async fn mark_all_outdated(&self) -> Result<usize> {
    let statuses = self.all_statuses().await?;
    let mut touched = 0;

    for mut status in statuses {
      if status.state != IndexState::Outdated {
        status.state = IndexState::Outdated;
        self.set_file_status(&status).await?;
        touched += 1;
      }
    }

    Ok(touched)
  }

  /// Reset states a crash can leave behind (`Queued`, `Parsing`,
  /// `Embedding`) to `Outdated` so the next scan picks the files up again.
  pub async fn reset_transient_statuses(&self) -> Result<usize> {
    let statuses = self.all_statuses().await?;
    let mut touched = 0;

    for mut status in statuses {
      if status.state.is_transient() {
        status.state = IndexState::Outdated;
        self.set_file_status(&status).await?;
        touched += 1;
      }
    }

    Ok(touched)
  }
}

fn status_to_batch(status: &FileStatus) -> Result<RecordBatch> {
  let path = StringArray::from(vec![status.path.clone()]);
  let state = StringArray::from(vec![status.state.as_str().to_string()]);
  let content_hash = StringArray::from(vec![status.content_hash.clone()]);
  let parser_version = UInt32Array::from(vec![status.parser_version]);
  let chunk_count = UInt32Array::from(vec![status.chunk_count as u32]);
  let indexed_at = Int64Array::from(vec![status.indexed_at.timestamp_millis()]);
  let last_error = StringArray::from(vec![status.last_error.clone()]);

  let batch = RecordBatch::try_new(
    file_status_schema(),
    vec![
      Arc::new(path),
      Arc::new(state),
      Arc::new(content_hash),
      Arc::new(parser_version),
      Arc::new(chunk_count),
      Arc::new(indexed_at),
      Arc::new(last_error),
    ],
  )?;

  Ok(batch)
}

fn batch_to_status(batch: &RecordBatch, row: usize) -> Result<FileStatus> {
  let get_string = |name: &str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {name}")))
  };

  let state_str = get_string("state")?;
  let state: IndexState = state_str.parse().map_err(DbError::NotFound)?;

  let parser_version = batch
    .column_by_name("parser_version")
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column parser_version".into()))?;

  let chunk_count = batch
    .column_by_name("chunk_count")
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column chunk_count".into()))?;

  let indexed_at_ms = batch
    .column_by_name("indexed_at")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column indexed_at".into()))?;

  let indexed_at = Utc
    .timestamp_millis_opt(indexed_at_ms)
    .single()
    .ok_or_else(|| DbError::InvalidRow("invalid indexed_at timestamp".into()))?;

  let last_error = batch
    .column_by_name("last_error")
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .and_then(|a| if a.is_null(row) { None } else { Some(a.value(row).to_string()) });

  Ok(FileStatus {
    path: get_string("path")?,
    state,
    content_hash: get_string("content_hash")?,
    parser_version,
    chunk_count: chunk_count as usize,
    indexed_at,
    last_error,
  })
}
