//! Single-host lock backend: the lock is one JSON record file.
//!
//! Creation uses exclusive create so two writers can never both succeed, and
//! every read-modify-write runs under an advisory lock on a sidecar guard
//! file so reclaim, renew and release never interleave across processes.

use super::{LockBackend, LockError};
use crate::models::SyncLock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug)]
struct LockPaths {
    record: PathBuf,
    guard: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FileLockBackend {
    paths: Arc<LockPaths>,
}

impl FileLockBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let record = path.as_ref().to_path_buf();
        let mut guard = record.clone().into_os_string();
        guard.push(".guard");
        Self {
            paths: Arc::new(LockPaths { record, guard: PathBuf::from(guard) }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.paths.record
    }

    async fn guarded<T, F>(&self, op: F) -> Result<T, LockError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, LockError> + Send + 'static,
    {
        let paths = self.paths.clone();
        tokio::task::spawn_blocking(move || paths.with_guard(op))
            .await
            .map_err(|e| LockError::Worker(e.to_string()))?
    }
}

impl LockPaths {
    fn with_guard<T>(&self, op: impl FnOnce(&Path) -> Result<T, LockError>) -> Result<T, LockError> {
        if let Some(parent) = self.record.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let guard = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.guard)?;
        guard.lock_exclusive()?;
        // released when `guard` drops
        op(&self.record)
    }
}

fn read_record(path: &Path) -> Result<Option<SyncLock>, LockError> {
    let txt = match fs::read_to_string(path) {
        Ok(txt) => txt,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str(&txt) {
        Ok(lock) => Ok(Some(lock)),
        Err(e) => {
            // an unreadable record would wedge every future acquire
            warn!(path = %path.display(), error = %e, "corrupt lock file, removing");
            remove_record(path)?;
            Ok(None)
        }
    }
}

fn create_record(path: &Path, lock: &SyncLock) -> Result<bool, LockError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    file.write_all(serde_json::to_string_pretty(lock)?.as_bytes())?;
    file.sync_all()?;
    Ok(true)
}

fn replace_record(path: &Path, lock: &SyncLock) -> Result<(), LockError> {
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);
    {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(serde_json::to_string_pretty(lock)?.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_record(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl LockBackend for FileLockBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn put_if_absent(&self, lock: &SyncLock) -> Result<Option<SyncLock>, LockError> {
        let lock = lock.clone();
        self.guarded(move |path| {
            if let Some(existing) = read_record(path)? {
                return Ok(Some(existing));
            }
            if create_record(path, &lock)? {
                return Ok(None);
            }
            // created by a writer outside the guard between read and create
            Ok(read_record(path)?)
        })
        .await
    }

    async fn load(&self) -> Result<Option<SyncLock>, LockError> {
        self.guarded(read_record).await
    }

    async fn remove_if_owner(&self, lock_id: &str) -> Result<bool, LockError> {
        let lock_id = lock_id.to_string();
        self.guarded(move |path| match read_record(path)? {
            Some(current) if current.lock_id == lock_id => {
                remove_record(path)?;
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }

    async fn renew(&self, lock_id: &str, acquired_at: DateTime<Utc>) -> Result<bool, LockError> {
        let lock_id = lock_id.to_string();
        self.guarded(move |path| match read_record(path)? {
            Some(mut current) if current.lock_id == lock_id => {
                current.acquired_at = acquired_at;
                replace_record(path, &current)?;
                Ok(true)
            }
            _ => Ok(false),
        })
        .await
    }

    async fn remove_any(&self) -> Result<Option<SyncLock>, LockError> {
        self.guarded(|path| {
            let current = read_record(path)?;
            if current.is_some() {
                remove_record(path)?;
            }
            Ok(current)
        })
        .await
    }
}
