//! Sentence-based text chunker.
//!
//! Pure function from extracted text to ordered chunks. Sentences are found
//! with a lightweight boundary heuristic (terminal punctuation followed by
//! whitespace, tolerant of multilingual punctuation), greedily packed until
//! the target token estimate is reached, and an overlap tail of the previous
//! chunk is carried forward so meaning spanning a boundary survives.
//!
//! Offsets are byte offsets into the extracted UTF-8 text. Every chunk text
//! is an exact slice of the input at its offset.

use semadex_core::{Chunk, IndexConfig, estimate_tokens};

/// Configuration for the chunker.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
  /// Target chunk size in estimated tokens
  pub target_tokens: usize,
  /// Overlap tail carried into the next chunk, in estimated tokens
  pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
  fn default() -> Self {
    Self {
      target_tokens: 500,
      overlap_tokens: 80,
    }
  }
}

impl From<&IndexConfig> for ChunkerConfig {
  fn from(config: &IndexConfig) -> Self {
    Self {
      target_tokens: config.target_tokens,
      overlap_tokens: config.overlap_tokens,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Chunker {
  config: ChunkerConfig,
}

impl Default for Chunker {
  fn default() -> Self {
    Self::new(ChunkerConfig::default())
  }
}

/// A sentence located in the source text.
#[derive(Debug, Clone, Copy)]
struct Sentence<'a> {
  offset: usize,
  text: &'a str,
  tokens: usize,
}

impl Chunker {
  pub fn new(config: ChunkerConfig) -> Self {
    Self { config }
  }

  /// Split text into overlapping chunks.
  ///
  /// Empty or whitespace-only input yields no chunks. A single sentence
  /// longer than the target is kept whole in its own chunk; sentences are
  /// never split.
  pub fn chunk(&self, text: &str) -> Vec<Chunk> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
      return Vec::new();
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<Sentence> = Vec::new();
    let mut current_tokens = 0usize;
    // Number of sentences at the front of `current` carried over as overlap
    let mut carried = 0usize;

    for sentence in sentences {
      if !current.is_empty() && current_tokens + sentence.tokens > self.config.target_tokens {
        chunks.push(build_chunk(text, &current, chunks.len()));

        let tail = self.overlap_tail(&current);
        carried = tail.len();
        current_tokens = tail.iter().map(|s| s.tokens).sum();
        current = tail;
      }

      current_tokens += sentence.tokens;
      current.push(sentence);
    }

    // Only flush if something beyond the carried overlap remains
    if current.len() > carried {
      chunks.push(build_chunk(text, &current, chunks.len()));
    }

    chunks
  }

  /// Trailing sentences of the previous chunk totalling at most
  /// `overlap_tokens`. May be empty when even the last sentence is too big.
  fn overlap_tail<'a>(&self, sentences: &[Sentence<'a>]) -> Vec<Sentence<'a>> {
    let mut tail: Vec<Sentence> = Vec::new();
    let mut tokens = 0usize;

    for sentence in sentences.iter().rev() {
      if tokens + sentence.tokens > self.config.overlap_tokens {
        break;
      }
      tokens += sentence.tokens;
      tail.push(*sentence);
    }

    tail.reverse();
    tail
  }
}

fn build_chunk(text: &str, sentences: &[Sentence], chunk_index: usize) -> Chunk {
  let first = sentences.first().expect("chunk must contain a sentence");
  let last = sentences.last().expect("chunk must contain a sentence");
  let start = first.offset;
  let end = last.offset + last.text.len();

  Chunk {
    chunk_index,
    offset: start,
    text: text[start..end].to_string(),
  }
}

/// Terminal punctuation ending a sentence, including common CJK forms.
fn is_terminal(ch: char) -> bool {
  matches!(ch, '.' | '!' | '?' | '…' | '。' | '！' | '？')
}

/// Locate sentences as byte ranges of the input.
///
/// A sentence ends at terminal punctuation followed by whitespace. Runs of
/// text without terminal punctuation (headings, fragments) form one
/// sentence ending at the next boundary or end of input.
fn split_sentences(text: &str) -> Vec<Sentence<'_>> {
  let mut sentences = Vec::new();
  let mut start: Option<usize> = None;
  let mut last_non_ws_end = 0usize;
  let mut prev_terminal = false;

  for (i, ch) in text.char_indices() {
    if ch.is_whitespace() {
      if prev_terminal && let Some(s) = start.take() {
        let slice = &text[s..last_non_ws_end];
        sentences.push(Sentence {
          offset: s,
          text: slice,
          tokens: estimate_tokens(slice),
        });
      }
      prev_terminal = false;
      continue;
    }

    if start.is_none() {
      start = Some(i);
    }
    last_non_ws_end = i + ch.len_utf8();
    prev_terminal = is_terminal(ch);
  }

  if let Some(s) = start {
    let slice = &text[s..last_non_ws_end];
    sentences.push(Sentence {
      offset: s,
      text: slice,
      tokens: estimate_tokens(slice),
    });
  }

  sentences
}
