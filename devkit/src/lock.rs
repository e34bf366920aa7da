use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inventory_kernel::lock::{LockBackend, LockError};
use inventory_kernel::models::SyncLock;
use parking_lot::Mutex;

/// Single-slot lock storage shared by every manager holding the same `Arc`.
/// Stands in for the Redis backend in multi-instance tests.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    slot: Mutex<Option<SyncLock>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a record directly, as a crashed or foreign holder would leave it.
    pub fn plant(&self, lock: SyncLock) {
        *self.slot.lock() = Some(lock);
    }

    pub fn current(&self) -> Option<SyncLock> {
        self.slot.lock().clone()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put_if_absent(&self, lock: &SyncLock) -> Result<Option<SyncLock>, LockError> {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(existing) => Ok(Some(existing.clone())),
            None => {
                *slot = Some(lock.clone());
                Ok(None)
            }
        }
    }

    async fn load(&self) -> Result<Option<SyncLock>, LockError> {
        Ok(self.current())
    }

    async fn remove_if_owner(&self, lock_id: &str) -> Result<bool, LockError> {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *slot = None;
            return Ok(true);
        }
        Ok(false)
    }

    async fn renew(&self, lock_id: &str, acquired_at: DateTime<Utc>) -> Result<bool, LockError> {
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            Some(current) if current.lock_id == lock_id => {
                current.acquired_at = acquired_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_any(&self) -> Result<Option<SyncLock>, LockError> {
        Ok(self.slot.lock().take())
    }
}
