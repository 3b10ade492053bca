//! Environment locking.
//!
//! Installs into one environment prefix are serialized twice over: an async
//! mutex per environment inside this process, and an advisory file lock on
//! `{prefix}/.lock` against other processes. The file carries JSON metadata
//! about the holder so contention errors can say who has it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::consts::ENV_LOCK_FILENAME;
use crate::request::EnvironmentId;

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at: DateTime<Utc>,
  pub holder: String,
  pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("{path} is locked by another process: {holder} (PID {pid}, since {started_at})")]
  Contention {
    holder: String,
    pid: u32,
    started_at: DateTime<Utc>,
    path: PathBuf,
  },

  #[error("{path} is locked by another process (could not read lock metadata)")]
  ContentionUnknown { path: PathBuf },

  #[error("failed to create lock directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

impl LockError {
  /// Another process holds the lock; trying again later may succeed.
  pub fn is_contention(&self) -> bool {
    matches!(self, LockError::Contention { .. } | LockError::ContentionUnknown { .. })
  }
}

/// An exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
  file: File,
  path: PathBuf,
}

impl FileLock {
  /// Take the lock or fail immediately with `Contention`.
  pub fn try_acquire(path: &Path, holder: &str) -> Result<Self, LockError> {
    let file = open_lock_file(path)?;
    if let Err(err) = lock_file(&file, false) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(read_contention_error(path));
      }
      return Err(LockError::LockFailed(err));
    }
    Self::finish(file, path, holder)
  }

  /// Take the lock, blocking the current thread until it is free.
  pub fn acquire_blocking(path: &Path, holder: &str) -> Result<Self, LockError> {
    let file = open_lock_file(path)?;
    lock_file(&file, true).map_err(LockError::LockFailed)?;
    Self::finish(file, path, holder)
  }

  fn finish(file: File, path: &Path, holder: &str) -> Result<Self, LockError> {
    write_metadata(&file, path, holder)?;
    Ok(Self {
      file,
      path: path.to_path_buf(),
    })
  }

  /// Reads the metadata through the held handle, which works even where
  /// locks are mandatory.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
  if let Some(parent) = path.parent()
    && !parent.exists()
  {
    std::fs::create_dir_all(parent).map_err(LockError::CreateDir)?;
  }

  OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(path)
    .map_err(LockError::OpenFile)
}

fn write_metadata(file: &File, path: &Path, holder: &str) -> Result<(), LockError> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at: Utc::now(),
    holder: holder.to_string(),
    path: path.to_path_buf(),
  };

  file.set_len(0).map_err(LockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(LockError::WriteMetadata)?;
  Ok(())
}

fn read_contention_error(path: &Path) -> LockError {
  if let Ok(mut file) = File::open(path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
      return LockError::Contention {
        holder: metadata.holder,
        pid: metadata.pid,
        started_at: metadata.started_at,
        path: path.to_path_buf(),
      };
    }
  }

  LockError::ContentionUnknown {
    path: path.to_path_buf(),
  }
}

#[cfg(unix)]
fn lock_file(file: &File, blocking: bool) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = if blocking {
    FlockOperation::LockExclusive
  } else {
    FlockOperation::NonBlockingLockExclusive
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn lock_file(file: &File, blocking: bool) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = if blocking {
    LOCKFILE_EXCLUSIVE_LOCK
  } else {
    LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK
  };

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}

/// Per-environment install locks shared by every task of an orchestrator.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentLocks {
  inner: Arc<Mutex<HashMap<EnvironmentId, Arc<Mutex<()>>>>>,
}

impl EnvironmentLocks {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn handle(&self, id: &EnvironmentId, prefix: &Path) -> EnvironmentLock {
    let mut map = self.inner.lock().await;
    let mutex = map.entry(id.clone()).or_default().clone();
    EnvironmentLock {
      mutex,
      lock_path: prefix.join(ENV_LOCK_FILENAME),
    }
  }
}

/// Handle used by drivers to take the install lock of one environment.
#[derive(Debug, Clone)]
pub struct EnvironmentLock {
  mutex: Arc<Mutex<()>>,
  lock_path: PathBuf,
}

impl EnvironmentLock {
  /// A standalone lock, not shared with any orchestrator.
  pub fn detached(prefix: &Path) -> Self {
    Self {
      mutex: Arc::new(Mutex::new(())),
      lock_path: prefix.join(ENV_LOCK_FILENAME),
    }
  }

  /// Wait for the in-process mutex, then take the file lock. Fails fast with
  /// `Contention` when another process holds the file.
  pub async fn acquire(&self, holder: &str) -> Result<EnvironmentGuard, LockError> {
    let guard = self.mutex.clone().lock_owned().await;
    let file = FileLock::try_acquire(&self.lock_path, holder)?;
    debug!(lock = %self.lock_path.display(), holder = %holder, "acquired environment lock");
    Ok(EnvironmentGuard { _file: file, _guard: guard })
  }

  pub fn path(&self) -> &Path {
    &self.lock_path
  }
}

#[derive(Debug)]
pub struct EnvironmentGuard {
  _file: FileLock,
  _guard: OwnedMutexGuard<()>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tempfile::TempDir;

  #[test]
  fn file_lock_writes_metadata() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("env").join(ENV_LOCK_FILENAME);

    let lock = FileLock::try_acquire(&path, "zlib@1.3").unwrap();
    let metadata = lock.read_metadata().unwrap();

    assert_eq!(metadata.version, 1);
    assert_eq!(metadata.holder, "zlib@1.3");
    assert_eq!(metadata.pid, std::process::id());
    assert!(lock.path().exists());
  }

  #[test]
  fn second_file_lock_reports_contention() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join(ENV_LOCK_FILENAME);

    let _held = FileLock::try_acquire(&path, "first").unwrap();
    let err = FileLock::try_acquire(&path, "second").unwrap_err();

    assert!(err.is_contention());
    match err {
      LockError::Contention { holder, .. } => assert_eq!(holder, "first"),
      LockError::ContentionUnknown { .. } => {}
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn file_lock_released_on_drop() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join(ENV_LOCK_FILENAME);

    {
      let _lock = FileLock::try_acquire(&path, "first").unwrap();
    }
    FileLock::try_acquire(&path, "second").unwrap();
  }

  #[tokio::test]
  async fn environment_lock_serializes_in_process() {
    let temp = TempDir::new().unwrap();
    let locks = EnvironmentLocks::new();
    let env = EnvironmentId::new("env").unwrap();
    let a = locks.handle(&env, temp.path()).await;
    let b = locks.handle(&env, temp.path()).await;

    let guard = a.acquire("a").await.unwrap();
    let waiting = tokio::spawn(async move { b.acquire("b").await.map(|_| ()) });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    drop(guard);
    tokio::time::timeout(Duration::from_secs(1), waiting)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn different_environments_do_not_block() {
    let temp = TempDir::new().unwrap();
    let locks = EnvironmentLocks::new();
    let a = locks
      .handle(&EnvironmentId::new("a").unwrap(), &temp.path().join("a"))
      .await;
    let b = locks
      .handle(&EnvironmentId::new("b").unwrap(), &temp.path().join("b"))
      .await;

    let _ga = a.acquire("a").await.unwrap();
    let _gb = b.acquire("b").await.unwrap();
  }
}
