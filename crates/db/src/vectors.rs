//! Vector store adapter.
//!
//! Writes are serialised behind the single writer lane; searches read the
//! engine's snapshot and may run concurrently with writes. `replace_file`
//! holds the lane across delete and insert so the store only ever exposes
//! the old row set or the new one.

use arrow_array::{
  Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
  UInt64Array,
};
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::DistanceType;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use semadex_core::{Hit, VectorRow};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::connection::{DbError, Result, SearchDb, escape_literal};
use crate::schema::vectors_schema;

/// Store-level counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
  pub row_count: usize,
  pub distinct_paths: usize,
}

impl SearchDb {
  /// Append or merge rows by id.
  pub async fn upsert_rows(&self, rows: &[VectorRow]) -> Result<()> {
    if rows.is_empty() {
      return Ok(());
    }

    let _guard = self.write_lane.lock().await;
    let table = self.vectors_table().await?;

    // Remove any existing rows with these ids first
    for ids in rows.chunks(100) {
      let list = ids
        .iter()
        .map(|r| format!("'{}'", escape_literal(&r.id)))
        .collect::<Vec<_>>()
        .join(", ");
      table.delete(&format!("id IN ({list})")).await?;
    }

    let batch = rows_to_batch(rows, self.vector_dim)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], vectors_schema(self.vector_dim));
    table.add(Box::new(batches)).execute().await?;

    trace!(rows = rows.len(), "Upserted vector rows");
    Ok(())
  }

  /// Remove all rows for a path.
  pub async fn delete_by_path(&self, path: &str) -> Result<()> {
    let _guard = self.write_lane.lock().await;
    let table = self.vectors_table().await?;
    table.delete(&format!("path = '{}'", escape_literal(path))).await?;
    debug!(path, "Deleted vector rows for path");
    Ok(())
  }

  /// Atomically replace all rows for a path: after this returns the store
  /// holds exactly `rows` for `path`, and a crash mid-way leaves either the
  /// old set or the new set.
  pub async fn replace_file(&self, path: &str, rows: &[VectorRow]) -> Result<()> {
    let _guard = self.write_lane.lock().await;
    let table = self.vectors_table().await?;

    table.delete(&format!("path = '{}'", escape_literal(path))).await?;

    if !rows.is_empty() {
      for row in rows {
        if row.path != path {
          return Err(DbError::InvalidRow(format!(
            "row {} does not belong to path {path}",
            row.id
          )));
        }
      }
      let batch = rows_to_batch(rows, self.vector_dim)?;
      let batches = RecordBatchIterator::new(vec![Ok(batch)], vectors_schema(self.vector_dim));
      table.add(Box::new(batches)).execute().await?;
    }

    debug!(path, rows = rows.len(), "Replaced vector rows for path");
    Ok(())
  }

  /// Top-k nearest neighbours by cosine similarity, best first.
  pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
    if query.len() != self.vector_dim {
      return Err(DbError::InvalidRow(format!(
        "query vector has dimension {}, store expects {}",
        query.len(),
        self.vector_dim
      )));
    }

    let table = self.vectors_table().await?;
    let results: Vec<RecordBatch> = table
      .vector_search(query.to_vec())?
      .distance_type(DistanceType::Cosine)
      .limit(k)
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut hits = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        hits.push(batch_to_hit(&batch, i)?);
      }
    }

    // LanceDB returns ascending distance; keep descending score explicit
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(hits)
  }

  /// All rows stored for a path, in chunk order.
  pub async fn rows_for_path(&self, path: &str) -> Result<Vec<VectorRow>> {
    let table = self.vectors_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("path = '{}'", escape_literal(path)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut rows = Vec::new();
    for batch in results {
      for i in 0..batch.num_rows() {
        rows.push(batch_to_row(&batch, i)?);
      }
    }
    rows.sort_by_key(|r| r.chunk_index);
    Ok(rows)
  }

  /// Row and path counts.
  pub async fn stats(&self) -> Result<StoreStats> {
    let table = self.vectors_table().await?;
    let row_count = table.count_rows(None).await?;

    let results: Vec<RecordBatch> = table
      .query()
      .select(Select::Columns(vec!["path".to_string()]))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut paths = HashSet::new();
    for batch in results {
      if let Some(col) = batch.column_by_name("path").and_then(|c| c.as_any().downcast_ref::<StringArray>()) {
        for i in 0..batch.num_rows() {
          paths.insert(col.value(i).to_string());
        }
      }
    }

    Ok(StoreStats {
      row_count,
      distinct_paths: paths.len(),
    })
  }

  /// Best-effort space reclamation; safe to run concurrently with search.
  pub async fn compact(&self) -> Result<()> {
    let _guard = self.write_lane.lock().await;
    let table = self.vectors_table().await?;
    table.optimize(lancedb::table::OptimizeAction::All).await?;
    debug!("Compacted vector table");
    Ok(())
  }
}

fn rows_to_batch(rows: &[VectorRow], dim: usize) -> Result<RecordBatch> {
  let mut flat = Vec::with_capacity(rows.len() * dim);
  for row in rows {
    if row.vector.len() != dim {
      return Err(DbError::InvalidRow(format!(
        "row {} has vector dimension {}, store expects {dim}",
        row.id,
        row.vector.len()
      )));
    }
    flat.extend_from_slice(&row.vector);
  }

  let ids = StringArray::from_iter_values(rows.iter().map(|r| r.id.as_str()));
  let paths = StringArray::from_iter_values(rows.iter().map(|r| r.path.as_str()));
  let chunk_indexes = UInt32Array::from_iter_values(rows.iter().map(|r| r.chunk_index as u32));
  let offsets = UInt64Array::from_iter_values(rows.iter().map(|r| r.offset as u64));
  let texts = StringArray::from_iter_values(rows.iter().map(|r| r.text.as_str()));
  let mtimes = Int64Array::from_iter_values(rows.iter().map(|r| r.mtime));
  let parser_versions = UInt32Array::from_iter_values(rows.iter().map(|r| r.parser_version));
  let indexed_ats = Int64Array::from_iter_values(rows.iter().map(|r| r.indexed_at.timestamp_millis()));

  let values = Float32Array::from(flat);
  let item_field = Arc::new(arrow_schema::Field::new("item", arrow_schema::DataType::Float32, true));
  let vectors = FixedSizeListArray::try_new(item_field, dim as i32, Arc::new(values), None)?;

  let batch = RecordBatch::try_new(
    vectors_schema(dim),
    vec![
      Arc::new(ids),
      Arc::new(paths),
      Arc::new(chunk_indexes),
      Arc::new(offsets),
      Arc::new(texts),
      Arc::new(mtimes),
      Arc::new(parser_versions),
      Arc::new(indexed_ats),
      Arc::new(vectors),
    ],
  )?;

  Ok(batch)
}

fn get_string(batch: &RecordBatch, name: &str, row: usize) -> Result<String> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .map(|a| a.value(row).to_string())
    .ok_or_else(|| DbError::NotFound(format!("column {name}")))
}

fn get_u32(batch: &RecordBatch, name: &str, row: usize) -> Result<u32> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound(format!("column {name}")))
}

fn get_u64(batch: &RecordBatch, name: &str, row: usize) -> Result<u64> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound(format!("column {name}")))
}

fn get_i64(batch: &RecordBatch, name: &str, row: usize) -> Result<i64> {
  batch
    .column_by_name(name)
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound(format!("column {name}")))
}

fn get_vector(batch: &RecordBatch, row: usize) -> Result<Vec<f32>> {
  let list = batch
    .column_by_name("vector")
    .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
    .ok_or_else(|| DbError::NotFound("column vector".to_string()))?;

  let value = list.value(row);
  let floats = value
    .as_any()
    .downcast_ref::<Float32Array>()
    .ok_or_else(|| DbError::NotFound("vector items".to_string()))?;

  Ok(floats.values().to_vec())
}

fn batch_to_hit(batch: &RecordBatch, row: usize) -> Result<Hit> {
  // Cosine distance in [0, 2]; similarity = 1 - distance
  let distance = batch
    .column_by_name("_distance")
    .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
    .map(|a| a.value(row))
    .unwrap_or(0.0);

  Ok(Hit {
    id: get_string(batch, "id", row)?,
    path: get_string(batch, "path", row)?,
    chunk_index: get_u32(batch, "chunk_index", row)? as usize,
    offset: get_u64(batch, "offset", row)? as usize,
    text: get_string(batch, "text", row)?,
    score: 1.0 - distance,
    mtime: get_i64(batch, "mtime", row)?,
  })
}

fn batch_to_row(batch: &RecordBatch, row: usize) -> Result<VectorRow> {
  let indexed_at = Utc
    .timestamp_millis_opt(get_i64(batch, "indexed_at", row)?)
    .single()
    .ok_or_else(|| DbError::InvalidRow("invalid indexed_at timestamp".into()))?;

  Ok(VectorRow {
    id: get_string(batch, "id", row)?,
    path: get_string(batch, "path", row)?,
    chunk_index: get_u32(batch, "chunk_index", row)? as usize,
    offset: get_u64(batch, "offset", row)? as usize,
    text: get_string(batch, "text", row)?,
    vector: get_vector(batch, row)?,
    mtime: get_i64(batch, "mtime", row)?,
    parser_version: get_u32(batch, "parser_version", row)?,
    indexed_at,
  })
}
