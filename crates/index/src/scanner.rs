//! Watched-root scanner.
//!
//! Walks the configured roots, applies the exclude and bundle glob filters,
//! and produces one record per eligible file with the metadata the re-index
//! decision needs (size, mtime, content hash of the bytes to be parsed).

use crate::parser::ParserRegistry;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use semadex_core::{WatchConfig, content_hash};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Glob-based admission filter shared by the scanner and the watcher.
#[derive(Debug, Clone)]
pub struct PathFilter {
  exclude: GlobSet,
  bundles: GlobSet,
  exclude_bundles: bool,
}

impl PathFilter {
  pub fn from_config(config: &WatchConfig) -> Self {
    Self {
      exclude: build_globset(&config.exclude_patterns),
      bundles: build_globset(&config.bundle_patterns),
      exclude_bundles: config.exclude_bundles,
    }
  }

  pub fn empty() -> Self {
    Self {
      exclude: GlobSet::empty(),
      bundles: GlobSet::empty(),
      exclude_bundles: false,
    }
  }

  /// Whether a path is filtered out up-front.
  pub fn is_excluded(&self, path: &Path) -> bool {
    if self.exclude.is_match(path) {
      return true;
    }
    self.exclude_bundles && self.bundles.is_match(path)
  }
}

fn build_globset(patterns: &[String]) -> GlobSet {
  let mut builder = GlobSetBuilder::new();
  for pattern in patterns {
    match Glob::new(pattern) {
      Ok(glob) => {
        builder.add(glob);
      }
      Err(e) => warn!(pattern, error = %e, "Ignoring invalid glob pattern"),
    }
  }
  builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Result of scanning a single file.
#[derive(Debug, Clone)]
pub struct ScannedFile {
  pub path: PathBuf,
  pub extension: String,
  pub size: u64,
  pub mtime: i64,
  pub content_hash: String,
}

/// Result of scanning the watched roots.
#[derive(Debug, Default)]
pub struct ScanResult {
  pub files: Vec<ScannedFile>,
  pub skipped: usize,
}

pub struct Scanner {
  filter: PathFilter,
  max_file_size: u64,
}

impl Scanner {
  pub fn new(config: &WatchConfig) -> Self {
    Self {
      filter: PathFilter::from_config(config),
      max_file_size: config.max_file_size,
    }
  }

  pub fn filter(&self) -> &PathFilter {
    &self.filter
  }

  /// Scan one root for eligible files.
  pub fn scan(&self, root: &Path, registry: &ParserRegistry) -> ScanResult {
    let mut result = ScanResult::default();

    let walker = WalkBuilder::new(root)
      .follow_links(false)
      .hidden(true)
      .git_ignore(false)
      .git_global(false)
      .git_exclude(false)
      .build();

    for entry in walker.filter_map(|e| e.ok()) {
      let path = entry.path();

      if entry.file_type().is_none_or(|ft| ft.is_dir()) {
        continue;
      }

      if self.filter.is_excluded(path) {
        result.skipped += 1;
        continue;
      }

      if !registry.is_eligible(path) {
        continue;
      }

      match self.scan_file(path, registry) {
        Some(file) => result.files.push(file),
        None => result.skipped += 1,
      }
    }

    debug!(
      root = %root.display(),
      files = result.files.len(),
      skipped = result.skipped,
      "Scanned root"
    );
    result
  }

  /// Scan a single path, returning None when it is not indexable.
  pub fn scan_file(&self, path: &Path, registry: &ParserRegistry) -> Option<ScannedFile> {
    if self.filter.is_excluded(path) || !registry.is_eligible(path) {
      return None;
    }

    let metadata = path.metadata().ok()?;
    if !metadata.is_file() {
      return None;
    }
    if metadata.len() > self.max_file_size {
      debug!(path = %path.display(), size = metadata.len(), "Skipping oversized file");
      return None;
    }

    let mtime = metadata
      .modified()
      .ok()
      .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
      .map(|d| d.as_secs() as i64)
      .unwrap_or(0);

    // Hash the bytes that will be parsed
    let bytes = std::fs::read(path).ok()?;

    Some(ScannedFile {
      path: path.to_path_buf(),
      extension: path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase(),
      size: metadata.len(),
      mtime,
      content_hash: content_hash(&bytes),
    })
  }
}
