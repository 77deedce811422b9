//! Event debouncing.
//!
//! Rapid editor save sequences produce bursts of events per path. Changes
//! accumulate per path and are only released once the path has been quiet
//! for the debounce window, with event kinds coalesced along the way.

use crate::watcher::{ChangeKind, FileChange};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::trace;

/// Configuration for the debouncer.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
  /// Quiet period before a change is released (default 500ms)
  pub debounce: Duration,
  /// Pending-event count that forces a flush
  pub max_pending: usize,
}

impl Default for DebounceConfig {
  fn default() -> Self {
    Self {
      debounce: Duration::from_millis(500),
      max_pending: 256,
    }
  }
}

#[derive(Debug, Clone)]
struct PendingChange {
  kind: ChangeKind,
  last_seen: Instant,
}

impl PendingChange {
  fn new(kind: ChangeKind) -> Self {
    Self {
      kind,
      last_seen: Instant::now(),
    }
  }

  fn update(&mut self, kind: ChangeKind) {
    self.last_seen = Instant::now();
    self.kind = coalesce(self.kind, kind);
  }
}

/// Net effect of two events on the same path within one debounce window.
///
/// Only the endpoints matter: did the file exist before the first event,
/// and does it exist after the second? Newly appeared is a create, still
/// present is a modify, and anything ending in absence is a delete. This
/// is what makes an editor's delete-then-rewrite save land as a single
/// modify instead of a delete racing a create.
fn coalesce(first: ChangeKind, second: ChangeKind) -> ChangeKind {
  let existed_before = first != ChangeKind::Created;
  let exists_after = second != ChangeKind::Deleted;

  match (existed_before, exists_after) {
    (false, true) => ChangeKind::Created,
    (true, true) => ChangeKind::Modified,
    (_, false) => ChangeKind::Deleted,
  }
}

/// Per-path debouncer with event coalescing.
pub struct Debouncer {
  config: DebounceConfig,
  pending: HashMap<PathBuf, PendingChange>,
}

impl Default for Debouncer {
  fn default() -> Self {
    Self::new(DebounceConfig::default())
  }
}

impl Debouncer {
  pub fn new(config: DebounceConfig) -> Self {
    Self {
      config,
      pending: HashMap::new(),
    }
  }

  /// Record a raw change.
  pub fn record(&mut self, change: FileChange) {
    trace!(path = %change.path.display(), kind = ?change.kind, "Recording change");
    match self.pending.get_mut(&change.path) {
      Some(pending) => pending.update(change.kind),
      None => {
        self.pending.insert(change.path, PendingChange::new(change.kind));
      }
    }
  }

  /// Changes whose debounce window has elapsed.
  pub fn collect_ready(&mut self) -> Vec<FileChange> {
    let now = Instant::now();
    let ready_paths: Vec<PathBuf> = self
      .pending
      .iter()
      .filter(|(_, pending)| now.duration_since(pending.last_seen) >= self.config.debounce)
      .map(|(path, _)| path.clone())
      .collect();

    ready_paths
      .into_iter()
      .filter_map(|path| {
        self.pending.remove(&path).map(|pending| FileChange {
          path,
          kind: pending.kind,
        })
      })
      .collect()
  }

  /// All pending changes regardless of the debounce window.
  pub fn collect_all(&mut self) -> Vec<FileChange> {
    self
      .pending
      .drain()
      .map(|(path, pending)| FileChange {
        path,
        kind: pending.kind,
      })
      .collect()
  }

  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }

  pub fn should_force_flush(&self) -> bool {
    self.pending.len() >= self.config.max_pending
  }
}
