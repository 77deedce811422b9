pub mod config;
pub mod types;

pub use config::{
  Config, EmbeddingConfig, IndexConfig, Pooling, QueueConfig, SchedulerConfig, SearchConfig, WatchConfig,
};
pub use types::{
  CHARS_PER_TOKEN_X10, Chunk, FileStatus, Hit, IndexState, IngestionId, VectorRow, content_hash, estimate_tokens,
  row_id,
};
