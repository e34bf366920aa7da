/**
 * SYNC LOCK - Verrou à bail partagé entre toutes les instances
 *
 * ROLE :
 * Guarantees at most one live reconciliation across processes and hosts.
 * A lock is a small record (id, kind, acquired_at, lease, pid) stored in a
 * backend that offers an atomic put-if-absent.
 *
 * OPERATION :
 * - acquire : put-if-absent, reclaim once if the existing record expired
 * - heartbeat : background task rewriting acquired_at every lease/3
 * - release : owner-only removal, stops the heartbeat
 * - status : expired records are reported as absent and cleared
 *
 * BACKENDS : Redis (SET NX PX + Lua compare scripts) or a local lock file
 * (exclusive create + advisory guard). Callers only see `LockManager`.
 */

mod file;
mod redis_backend;

pub use self::file::FileLockBackend;
pub use self::redis_backend::RedisLockBackend;

use crate::models::{SyncKind, SyncLock};
use crate::state::SharedClock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock file IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(String),
    #[error("lock worker failed: {0}")]
    Worker(String),
}

/// Storage primitive behind the lock. Every method must be atomic with
/// respect to the other methods on the same backend.
#[async_trait]
pub trait LockBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stores `lock` if no record exists. Returns the existing record otherwise.
    async fn put_if_absent(&self, lock: &SyncLock) -> Result<Option<SyncLock>, LockError>;

    async fn load(&self) -> Result<Option<SyncLock>, LockError>;

    /// Removes the record only if it carries `lock_id`.
    async fn remove_if_owner(&self, lock_id: &str) -> Result<bool, LockError>;

    /// Rewrites `acquired_at` only if the record carries `lock_id`.
    async fn renew(&self, lock_id: &str, acquired_at: DateTime<Utc>) -> Result<bool, LockError>;

    /// Removes whatever record is present.
    async fn remove_any(&self) -> Result<Option<SyncLock>, LockError>;
}

pub type SharedLockBackend = Arc<dyn LockBackend>;

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Acquired(SyncLock),
    Conflict(SyncLock),
}

impl AcquireOutcome {
    pub fn acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }

    pub fn lock_id(&self) -> Option<&str> {
        match self {
            AcquireOutcome::Acquired(lock) => Some(&lock.lock_id),
            AcquireOutcome::Conflict(_) => None,
        }
    }

    pub fn conflicting_lock(&self) -> Option<&SyncLock> {
        match self {
            AcquireOutcome::Conflict(lock) => Some(lock),
            AcquireOutcome::Acquired(_) => None,
        }
    }
}

pub struct LockManager {
    backend: SharedLockBackend,
    clock: SharedClock,
    heartbeats: Mutex<HashMap<String, JoinHandle<()>>>,
    pid: u32,
}

impl LockManager {
    pub fn new(backend: SharedLockBackend, clock: SharedClock) -> Self {
        Self {
            backend,
            clock,
            heartbeats: Mutex::new(HashMap::new()),
            pid: std::process::id(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn acquire(&self, kind: SyncKind, lease_duration_ms: u64) -> Result<AcquireOutcome, LockError> {
        let now = self.clock.now();
        let lock = SyncLock {
            lock_id: generate_lock_id(now),
            kind,
            acquired_at: now,
            lease_duration_ms,
            owner_process_id: self.pid,
        };

        let existing = match self.backend.put_if_absent(&lock).await? {
            None => return Ok(self.on_acquired(lock)),
            Some(existing) => existing,
        };

        if existing.is_live(now) {
            debug!(held_by = %existing.lock_id, kind = %existing.kind, "lock busy");
            return Ok(AcquireOutcome::Conflict(existing));
        }

        info!(expired = %existing.lock_id, age_ms = existing.age_ms(now), "expired lock detected, reclaiming");
        self.backend.remove_if_owner(&existing.lock_id).await?;

        match self.backend.put_if_absent(&lock).await? {
            None => Ok(self.on_acquired(lock)),
            Some(winner) => Ok(AcquireOutcome::Conflict(winner)),
        }
    }

    fn on_acquired(&self, lock: SyncLock) -> AcquireOutcome {
        info!(lock_id = %lock.lock_id, kind = %lock.kind, backend = self.backend.name(), "sync lock acquired");
        self.start_heartbeat(&lock);
        AcquireOutcome::Acquired(lock)
    }

    /// Owner-only release. A mismatch (expired and reclaimed elsewhere) is
    /// logged and reported as `false`.
    pub async fn release(&self, lock_id: &str) -> bool {
        self.stop_heartbeat(lock_id);
        match self.backend.remove_if_owner(lock_id).await {
            Ok(true) => {
                info!(lock_id, "sync lock released");
                true
            }
            Ok(false) => {
                warn!(lock_id, "cannot release lock: not the current owner");
                false
            }
            Err(e) => {
                error!(lock_id, error = %e, "lock release failed");
                false
            }
        }
    }

    /// Current live lock. Expired records read as absent and are cleared.
    pub async fn status(&self) -> Result<Option<SyncLock>, LockError> {
        let Some(lock) = self.backend.load().await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        if lock.is_live(now) {
            return Ok(Some(lock));
        }
        debug!(lock_id = %lock.lock_id, "clearing expired lock");
        if let Err(e) = self.backend.remove_if_owner(&lock.lock_id).await {
            warn!(error = %e, "failed to clear expired lock");
        }
        Ok(None)
    }

    /// Removes a specific lock whoever owns it.
    pub async fn evict(&self, lock_id: &str) -> Result<bool, LockError> {
        self.stop_heartbeat(lock_id);
        self.backend.remove_if_owner(lock_id).await
    }

    /// Removes the current lock unconditionally.
    pub async fn force_release(&self) -> Result<Option<SyncLock>, LockError> {
        let removed = self.backend.remove_any().await?;
        if let Some(lock) = &removed {
            self.stop_heartbeat(&lock.lock_id);
        }
        Ok(removed)
    }

    /// Releases every lock this manager still holds.
    pub async fn shutdown(&self) {
        let held: Vec<String> = self.heartbeats.lock().keys().cloned().collect();
        for lock_id in held {
            self.release(&lock_id).await;
        }
    }

    pub fn holds(&self, lock_id: &str) -> bool {
        self.heartbeats.lock().contains_key(lock_id)
    }

    fn start_heartbeat(&self, lock: &SyncLock) {
        let backend = self.backend.clone();
        let clock = self.clock.clone();
        let lock_id = lock.lock_id.clone();
        let period = Duration::from_millis((lock.lease_duration_ms / 3).max(1));

        let handle = tokio::spawn({
            let lock_id = lock_id.clone();
            async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    match backend.renew(&lock_id, clock.now()).await {
                        Ok(true) => debug!(lock_id = %lock_id, "lease renewed"),
                        Ok(false) => {
                            warn!(lock_id = %lock_id, "lock no longer owned, heartbeat stopped");
                            break;
                        }
                        Err(e) => error!(lock_id = %lock_id, error = %e, "lock heartbeat failed"),
                    }
                }
            }
        });

        if let Some(previous) = self.heartbeats.lock().insert(lock_id, handle) {
            previous.abort();
        }
    }

    fn stop_heartbeat(&self, lock_id: &str) {
        if let Some(handle) = self.heartbeats.lock().remove(lock_id) {
            handle.abort();
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        for (_, handle) in self.heartbeats.lock().drain() {
            handle.abort();
        }
    }
}

fn generate_lock_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("sync_{}_{}", now.timestamp_millis(), &random[..9])
}
