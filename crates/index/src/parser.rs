//! Parser registry and built-in text extraction.
//!
//! Each parser is a pure `path → UTF-8 text` function identified by a
//! `parser_id` and an integer version. The version advances whenever a
//! parser's output changes in a way that invalidates prior vectors; re-index
//! decisions compare a file's last-used version against the registry.
//!
//! The core ships plain-text and Markdown parsers. Rich formats (PDF, DOCX,
//! spreadsheets) are external collaborators and register through the same
//! record shape.

use pulldown_cmark::{Event, Parser as MarkdownParser};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::trace;

pub const TEXT_PARSER_VERSION: u32 = 1;
pub const MARKDOWN_PARSER_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ParseError {
  #[error("no parser for extension: {0}")]
  UnknownExtension(String),
  #[error("parser {0} is disabled")]
  Disabled(String),
  #[error("unreadable file: {0}")]
  Unreadable(#[source] std::io::Error),
  #[error("file is corrupted or not text")]
  Corrupted,
  #[error("unsupported variant: {0}")]
  UnsupportedVariant(String),
}

/// Capability record for one parser.
#[derive(Debug, Clone)]
pub struct ParserSpec {
  pub id: String,
  pub version: u32,
  pub enabled: bool,
}

/// Process-wide mapping from file extension to parser capability.
#[derive(Debug, Clone)]
pub struct ParserRegistry {
  by_ext: HashMap<String, ParserSpec>,
}

impl Default for ParserRegistry {
  fn default() -> Self {
    Self::builtin()
  }
}

impl ParserRegistry {
  /// Registry with the built-in parsers, all enabled.
  pub fn builtin() -> Self {
    let mut by_ext = HashMap::new();

    for ext in ["txt", "text", "log"] {
      by_ext.insert(
        ext.to_string(),
        ParserSpec {
          id: "text".to_string(),
          version: TEXT_PARSER_VERSION,
          enabled: true,
        },
      );
    }

    for ext in ["md", "markdown"] {
      by_ext.insert(
        ext.to_string(),
        ParserSpec {
          id: "markdown".to_string(),
          version: MARKDOWN_PARSER_VERSION,
          enabled: true,
        },
      );
    }

    Self { by_ext }
  }

  /// Registry with per-parser enablement applied from config.
  pub fn from_config(config: &semadex_core::Config) -> Self {
    let mut registry = Self::builtin();
    for spec in registry.by_ext.values_mut() {
      spec.enabled = config.parser_enabled(&spec.id, spec.enabled);
    }
    registry
  }

  /// Override a parser's version. Behaviour changes that invalidate prior
  /// output must come through here so stored vectors are refreshed.
  pub fn set_version(&mut self, parser_id: &str, version: u32) {
    for spec in self.by_ext.values_mut() {
      if spec.id == parser_id {
        spec.version = version;
      }
    }
  }

  pub fn spec_for_ext(&self, ext: &str) -> Option<&ParserSpec> {
    self.by_ext.get(&ext.to_lowercase())
  }

  pub fn spec_for_path(&self, path: &Path) -> Option<&ParserSpec> {
    let ext = path.extension()?.to_str()?;
    self.spec_for_ext(ext)
  }

  /// Current parser version for a path, if one is registered and enabled.
  pub fn current_version(&self, path: &Path) -> Option<u32> {
    self.spec_for_path(path).filter(|s| s.enabled).map(|s| s.version)
  }

  /// Whether a path is eligible for indexing.
  pub fn is_eligible(&self, path: &Path) -> bool {
    self.spec_for_path(path).is_some_and(|s| s.enabled)
  }

  /// Extract plain text from a file.
  pub fn parse(&self, path: &Path) -> Result<String, ParseError> {
    let ext = path
      .extension()
      .and_then(|e| e.to_str())
      .map(|e| e.to_lowercase())
      .unwrap_or_default();

    let spec = self
      .by_ext
      .get(&ext)
      .ok_or_else(|| ParseError::UnknownExtension(ext.clone()))?;

    if !spec.enabled {
      return Err(ParseError::Disabled(spec.id.clone()));
    }

    trace!(path = %path.display(), parser = %spec.id, "Parsing file");

    match spec.id.as_str() {
      "text" => read_utf8(path),
      "markdown" => {
        let raw = read_utf8(path)?;
        Ok(markdown_to_text(&raw))
      }
      other => Err(ParseError::UnsupportedVariant(other.to_string())),
    }
  }
}

/// Read a file as UTF-8. Binary content (NUL bytes or invalid UTF-8) is
/// reported as corrupted, which covers binaries misnamed as `.txt`.
fn read_utf8(path: &Path) -> Result<String, ParseError> {
  let bytes = std::fs::read(path).map_err(ParseError::Unreadable)?;

  if bytes.contains(&0) {
    return Err(ParseError::Corrupted);
  }

  String::from_utf8(bytes).map_err(|_| ParseError::Corrupted)
}

/// Flatten Markdown to plain text, dropping syntax but keeping content,
/// including text inside code blocks. Block ends become line breaks;
/// inline markup (emphasis, links) flattens without breaking the sentence.
fn markdown_to_text(markdown: &str) -> String {
  use pulldown_cmark::TagEnd;

  let mut text = String::with_capacity(markdown.len());

  for event in MarkdownParser::new(markdown) {
    match event {
      Event::Text(t) | Event::Code(t) => text.push_str(&t),
      Event::SoftBreak | Event::HardBreak => text.push(' '),
      Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item | TagEnd::CodeBlock) => {
        if !text.ends_with('\n') && !text.is_empty() {
          text.push('\n');
        }
      }
      _ => {}
    }
  }

  text
}
