//! Domain types shared across the indexing and search pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Indexing state of a single file.
///
/// `Indexed` means the stored vectors match the file's current content hash
/// and the current parser version; any drift moves the file to `Outdated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
  Queued,
  Parsing,
  Embedding,
  Indexed,
  Failed,
  Outdated,
}

impl IndexState {
  pub fn as_str(&self) -> &'static str {
    match self {
      IndexState::Queued => "queued",
      IndexState::Parsing => "parsing",
      IndexState::Embedding => "embedding",
      IndexState::Indexed => "indexed",
      IndexState::Failed => "failed",
      IndexState::Outdated => "outdated",
    }
  }

  /// States a crash can leave behind; reset to `Outdated` at startup.
  pub fn is_transient(&self) -> bool {
    matches!(self, IndexState::Queued | IndexState::Parsing | IndexState::Embedding)
  }
}

impl std::str::FromStr for IndexState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "queued" => Ok(IndexState::Queued),
      "parsing" => Ok(IndexState::Parsing),
      "embedding" => Ok(IndexState::Embedding),
      "indexed" => Ok(IndexState::Indexed),
      "failed" => Ok(IndexState::Failed),
      "outdated" => Ok(IndexState::Outdated),
      other => Err(format!("unknown index state: {other}")),
    }
  }
}

impl std::fmt::Display for IndexState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Persistent per-path indexing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
  /// Absolute, canonical path
  pub path: String,
  pub state: IndexState,
  /// Content hash of the last successful index
  pub content_hash: String,
  /// Parser version of the last successful index
  pub parser_version: u32,
  pub chunk_count: usize,
  pub indexed_at: DateTime<Utc>,
  pub last_error: Option<String>,
}

impl FileStatus {
  pub fn new(path: impl Into<String>, state: IndexState) -> Self {
    Self {
      path: path.into(),
      state,
      content_hash: String::new(),
      parser_version: 0,
      chunk_count: 0,
      indexed_at: Utc::now(),
      last_error: None,
    }
  }
}

/// A contiguous slice of extracted text, sized to the embedding model's
/// context. `offset` is the byte offset of the chunk start in the extracted
/// UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
  pub chunk_index: usize,
  pub offset: usize,
  pub text: String,
}

/// One attempt to index one file. Ids are monotonic per process so a retried
/// file never collides with chunks from its previous attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IngestionId(pub u64);

impl std::fmt::Display for IngestionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A stored vector row. All rows for a path share `mtime` and
/// `parser_version`; they are replaced together on re-index.
#[derive(Debug, Clone)]
pub struct VectorRow {
  /// `{path}#{chunk_index}`
  pub id: String,
  pub path: String,
  pub chunk_index: usize,
  pub offset: usize,
  pub text: String,
  pub vector: Vec<f32>,
  pub mtime: i64,
  pub parser_version: u32,
  pub indexed_at: DateTime<Utc>,
}

/// Row id shared by the vector store and completion accounting.
pub fn row_id(path: &str, chunk_index: usize) -> String {
  format!("{path}#{chunk_index}")
}

/// A single nearest-neighbour hit. Score is cosine similarity; higher is
/// better.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
  pub id: String,
  pub path: String,
  pub chunk_index: usize,
  pub offset: usize,
  pub text: String,
  pub score: f32,
  pub mtime: i64,
}

/// Conservative characters-per-token estimate, scaled by ten (1 token is
/// assumed to be ~2.5 characters so multilingual and URL-heavy text never
/// overruns the server's context).
pub const CHARS_PER_TOKEN_X10: usize = 25;

/// Estimate the token count of a text for batch sizing.
pub fn estimate_tokens(text: &str) -> usize {
  (text.chars().count() * 10).div_ceil(CHARS_PER_TOKEN_X10)
}

/// Stable digest of the bytes actually parsed (sha-256, hex).
pub fn content_hash(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_index_state_roundtrip() {
    for state in [
      IndexState::Queued,
      IndexState::Parsing,
      IndexState::Embedding,
      IndexState::Indexed,
      IndexState::Failed,
      IndexState::Outdated,
    ] {
      let parsed: IndexState = state.as_str().parse().unwrap();
      assert_eq!(parsed, state);
    }
    assert!("bogus".parse::<IndexState>().is_err());
  }

  #[test]
  fn test_transient_states() {
    assert!(IndexState::Parsing.is_transient());
    assert!(IndexState::Embedding.is_transient());
    assert!(IndexState::Queued.is_transient());
    assert!(!IndexState::Indexed.is_transient());
    assert!(!IndexState::Failed.is_transient());
    assert!(!IndexState::Outdated.is_transient());
  }

  #[test]
  fn test_estimate_tokens_conservative() {
    // 10 chars at 2.5 chars/token = 4 tokens
    assert_eq!(estimate_tokens("abcdefghij"), 4);
    // Rounds up
    assert_eq!(estimate_tokens("abc"), 2);
    assert_eq!(estimate_tokens(""), 0);
  }

  #[test]
  fn test_estimate_tokens_counts_chars_not_bytes() {
    // CJK chars are 3 bytes each but count once
    assert_eq!(estimate_tokens("世界"), estimate_tokens("ab"));
  }

  #[test]
  fn test_content_hash_stable() {
    let a = content_hash(b"hello world");
    let b = content_hash(b"hello world");
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
    assert_ne!(a, content_hash(b"hello worlds"));
  }

  #[test]
  fn test_row_id_format() {
    assert_eq!(row_id("/tmp/a.txt", 3), "/tmp/a.txt#3");
  }
}
