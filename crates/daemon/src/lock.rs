//! Exclusive instance lock.
//!
//! One daemon owns a storage directory at a time. The lock is a JSON file
//! carrying the owner pid; a lock whose process is gone is stale and gets
//! cleaned up on the next acquire.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

const LOCK_FILE: &str = "semadex.lock";

#[derive(Error, Debug)]
pub enum LockError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("storage directory locked by process {0}")]
  Held(u32),
}

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
  pid: u32,
  started_at: u64,
}

/// Held exclusive lock over a storage directory. Released on drop.
pub struct InstanceLock {
  path: PathBuf,
  pid: u32,
}

impl InstanceLock {
  /// Acquire the lock for a storage directory, cleaning up a stale lock
  /// left by a dead process.
  pub fn acquire(data_dir: &Path) -> Result<Self, LockError> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(LOCK_FILE);

    if path.exists() {
      match read_lock(&path) {
        Ok(existing) if is_process_running(existing.pid) => {
          return Err(LockError::Held(existing.pid));
        }
        Ok(existing) => {
          info!(pid = existing.pid, "Cleaning up stale lock from dead process");
          std::fs::remove_file(&path)?;
        }
        Err(e) => {
          warn!(error = %e, "Corrupted lock file, removing");
          std::fs::remove_file(&path)?;
        }
      }
    }

    let info = LockInfo {
      pid: std::process::id(),
      started_at: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
    };
    std::fs::write(&path, serde_json::to_string_pretty(&info)?)?;

    info!(path = %path.display(), "Acquired instance lock");
    Ok(Self { path, pid: info.pid })
  }
}

impl Drop for InstanceLock {
  fn drop(&mut self) {
    // Only remove a lock this process owns
    if let Ok(info) = read_lock(&self.path)
      && info.pid == self.pid
    {
      let _ = std::fs::remove_file(&self.path);
      info!("Released instance lock");
    }
  }
}

fn read_lock(path: &Path) -> Result<LockInfo, LockError> {
  let content = std::fs::read_to_string(path)?;
  Ok(serde_json::from_str(&content)?)
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
  // kill(pid, 0) succeeds while the process exists
  unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(windows)]
fn is_process_running(pid: u32) -> bool {
  use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
  use windows_sys::Win32::System::Threading::{GetExitCodeProcess, OpenProcess, PROCESS_QUERY_INFORMATION};

  unsafe {
    let handle = OpenProcess(PROCESS_QUERY_INFORMATION, 0, pid);
    if handle.is_null() {
      return false;
    }
    let mut exit_code = 0;
    let result = GetExitCodeProcess(handle, &mut exit_code);
    CloseHandle(handle);
    result != 0 && exit_code == STILL_ACTIVE
  }
}

#[cfg(not(any(unix, windows)))]
fn is_process_running(_pid: u32) -> bool {
  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_acquire_and_release() {
    let dir = TempDir::new().unwrap();

    let lock = InstanceLock::acquire(dir.path()).unwrap();
    assert!(dir.path().join("semadex.lock").exists());

    // Same (live) process holds it
    let err = InstanceLock::acquire(dir.path()).unwrap_err();
    assert!(matches!(err, LockError::Held(pid) if pid == std::process::id()));

    drop(lock);
    assert!(!dir.path().join("semadex.lock").exists());

    // Reacquire after release
    let lock = InstanceLock::acquire(dir.path()).unwrap();
    drop(lock);
  }

  #[test]
  fn test_stale_lock_cleanup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("semadex.lock");

    // A pid that cannot exist
    let stale = LockInfo {
      pid: u32::MAX - 1,
      started_at: 0,
    };
    std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

    let lock = InstanceLock::acquire(dir.path()).unwrap();
    drop(lock);
  }

  #[test]
  fn test_corrupted_lock_cleanup() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("semadex.lock"), "not json at all").unwrap();

    let lock = InstanceLock::acquire(dir.path()).unwrap();
    drop(lock);
  }

  #[test]
  fn test_is_process_running_current() {
    assert!(is_process_running(std::process::id()));
  }
}
