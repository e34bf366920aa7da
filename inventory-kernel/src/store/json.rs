use super::{BatchWriteOutcome, DeviceStore, Inventory, StoreError};
use crate::models::{AuditEvent, DeviceRecord, InventoryStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Inventory cached in memory and persisted to a single JSON file.
///
/// Mutations are applied to a copy of the cache; the copy replaces the cache
/// only once it is on disk, so a failed write leaves nothing visible.
pub struct JsonDeviceStore {
    path: PathBuf,
    cache: RwLock<Inventory>,
}

impl JsonDeviceStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut inventory = match tokio::fs::read_to_string(&path).await {
            Ok(txt) if txt.trim().is_empty() => Inventory::default(),
            Ok(txt) => serde_json::from_str::<Inventory>(&txt)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no existing inventory file, starting fresh");
                Inventory::default()
            }
            Err(e) => return Err(e.into()),
        };
        inventory.reindex();
        info!(path = %path.display(), devices = inventory.devices.len(), "inventory loaded");
        Ok(Self { path, cache: RwLock::new(inventory) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `apply` on a copy; persists and swaps it in when `changed` says so.
    /// The write lock is held throughout so snapshots land in order.
    async fn commit<T>(
        &self,
        apply: impl FnOnce(&mut Inventory) -> T,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, StoreError> {
        let mut cache = self.cache.write().await;
        let mut next = cache.clone();
        let out = apply(&mut next);
        if changed(&out) {
            self.save(&next).await?;
            *cache = next;
        }
        Ok(out)
    }

    async fn save(&self, inventory: &Inventory) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(inventory)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %self.path.display(), "inventory saved");
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for JsonDeviceStore {
    async fn upsert_batch(&self, records: Vec<DeviceRecord>) -> Result<BatchWriteOutcome, StoreError> {
        self.commit(|inv| inv.upsert(records), |o: &BatchWriteOutcome| o.created + o.updated > 0)
            .await
    }

    async fn mark_absent_offline(
        &self,
        present: &HashSet<String>,
        seen_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.commit(|inv| inv.mark_absent_offline(present, seen_since, now), |marked: &usize| *marked > 0)
            .await
    }

    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.cache.read().await.devices.get(device_id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.cache.read().await.sorted_devices())
    }

    async fn stats(&self) -> Result<InventoryStats, StoreError> {
        Ok(self.cache.read().await.stats())
    }

    async fn record_audit_events(&self, events: Vec<AuditEvent>) -> Result<usize, StoreError> {
        self.commit(|inv| inv.record_audit(events), |inserted: &usize| *inserted > 0).await
    }

    async fn audit_events(&self) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self.cache.read().await.audit_events.clone())
    }
}
