//! File system watcher.
//!
//! Bridges notify's synchronous callbacks into the async world over an mpsc
//! channel. Raw events are mapped onto create/modify/delete changes;
//! `watch_loop` feeds them through the debouncer and the admission filter
//! into the scheduler.

use crate::debounce::Debouncer;
use crate::scanner::PathFilter;
use crate::scheduler::FileScheduler;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum WatchError {
  #[error("failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),
  #[error("failed to watch path: {0}")]
  Watch(#[source] notify::Error),
}

/// Type of file change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Created,
  Modified,
  Deleted,
}

/// A file change event.
#[derive(Debug, Clone)]
pub struct FileChange {
  pub path: PathBuf,
  pub kind: ChangeKind,
}

/// Watches the configured roots and yields file changes.
pub struct FileWatcher {
  // Held to keep the watcher alive
  _watcher: RecommendedWatcher,
  rx: mpsc::Receiver<Result<Event, notify::Error>>,
}

impl FileWatcher {
  pub fn new(roots: &[PathBuf]) -> Result<Self, WatchError> {
    let (tx, rx) = mpsc::channel::<Result<Event, notify::Error>>(256);

    let mut watcher = RecommendedWatcher::new(
      move |res| {
        // Runs on notify's thread; drop events if the channel is full
        let _ = tx.blocking_send(res);
      },
      NotifyConfig::default(),
    )
    .map_err(WatchError::Init)?;

    for root in roots {
      watcher.watch(root, RecursiveMode::Recursive).map_err(WatchError::Watch)?;
      info!(root = %root.display(), "Watching root");
    }

    Ok(Self { _watcher: watcher, rx })
  }

  /// Next file change, or None when the watcher is gone.
  pub async fn recv(&mut self) -> Option<FileChange> {
    while let Some(result) = self.rx.recv().await {
      match result {
        Ok(event) => {
          if let Some(change) = process_event(event) {
            return Some(change);
          }
        }
        Err(e) => warn!(error = %e, "Watch error"),
      }
    }
    None
  }
}

fn process_event(event: Event) -> Option<FileChange> {
  let path = event.paths.first()?.clone();

  // Directory events are uninteresting; deletions pass because the path
  // no longer exists
  if path.is_dir() {
    return None;
  }

  let kind = match event.kind {
    EventKind::Create(_) => ChangeKind::Created,
    EventKind::Modify(_) => ChangeKind::Modified,
    EventKind::Remove(_) => ChangeKind::Deleted,
    EventKind::Access(_) | EventKind::Any | EventKind::Other => {
      trace!(path = %path.display(), "Ignoring event");
      return None;
    }
  };

  Some(FileChange { path, kind })
}

/// Pump watcher events through the debouncer into the scheduler until
/// cancelled. Excluded paths are filtered before they reach the debouncer.
pub async fn watch_loop(
  mut watcher: FileWatcher,
  mut debouncer: Debouncer,
  filter: PathFilter,
  scheduler: FileScheduler,
  cancel: CancellationToken,
) {
  let mut tick = tokio::time::interval(Duration::from_millis(100));
  debug!("Watch loop starting");

  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => break,

      change = watcher.recv() => {
        match change {
          Some(change) => {
            if filter.is_excluded(&change.path) {
              trace!(path = %change.path.display(), "Excluded path, ignoring change");
            } else {
              debouncer.record(change);
            }
          }
          None => {
            warn!("Watcher channel closed");
            break;
          }
        }
      }

      _ = tick.tick() => {
        let ready = if debouncer.should_force_flush() {
          debouncer.collect_all()
        } else {
          debouncer.collect_ready()
        };
        for change in ready {
          scheduler.handle_event(change).await;
        }
      }
    }
  }

  debug!("Watch loop stopped");
}
