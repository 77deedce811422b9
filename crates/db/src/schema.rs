use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

/// Schema for the vectors table. One row per chunk; all rows for a path are
/// replaced together on re-index.
pub fn vectors_schema(vector_dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false), // {path}#{chunk_index}
    Field::new("path", DataType::Utf8, false),
    Field::new("chunk_index", DataType::UInt32, false),
    Field::new("offset", DataType::UInt64, false), // byte offset into extracted text
    Field::new("text", DataType::Utf8, false),
    Field::new("mtime", DataType::Int64, false),
    Field::new("parser_version", DataType::UInt32, false),
    Field::new("indexed_at", DataType::Int64, false), // Unix timestamp ms
    Field::new(
      "vector",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), vector_dim as i32),
      true,
    ),
  ]))
}

/// Schema for the file_status table. Exactly one row per path.
pub fn file_status_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("path", DataType::Utf8, false),
    Field::new("state", DataType::Utf8, false),
    Field::new("content_hash", DataType::Utf8, false),
    Field::new("parser_version", DataType::UInt32, false),
    Field::new("chunk_count", DataType::UInt32, false),
    Field::new("indexed_at", DataType::Int64, false), // Unix timestamp ms
    Field::new("last_error", DataType::Utf8, true),
  ]))
}
