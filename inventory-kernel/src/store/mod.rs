/**
 * DEVICE STORE - Persistance de l'inventaire et du journal d'audit
 *
 * ROLE :
 * Keyed collection of `DeviceRecord`s (one per upstream device id) plus the
 * deduplicated upstream audit events. The sync engine only mutates it via
 * keyed batch upserts and the targeted stale-marking update.
 *
 * IMPLEMENTATIONS :
 * - MemoryDeviceStore : tests and ephemeral deployments
 * - JsonDeviceStore : in-memory cache persisted to one JSON file
 *   (temp file + rename on every mutation)
 */

mod json;

pub use self::json::JsonDeviceStore;

use crate::models::{AuditEvent, DeviceRecord, DeviceStatus, InventoryStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub device_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWriteOutcome {
    pub created: usize,
    pub updated: usize,
    pub failures: Vec<WriteFailure>,
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Unordered best-effort upsert keyed by `device_id`. A bad record is
    /// reported in `failures` and does not stop the rest of the batch.
    /// `created_at` of an existing record is kept.
    async fn upsert_batch(&self, records: Vec<DeviceRecord>) -> Result<BatchWriteOutcome, StoreError>;

    /// Sets `status = offline` (and refreshes `updated_at`) on devices not in
    /// `present`, not already offline, last seen at or after `seen_since`.
    async fn mark_absent_offline(
        &self,
        present: &HashSet<String>,
        seen_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<DeviceRecord>, StoreError>;

    async fn stats(&self) -> Result<InventoryStats, StoreError>;

    /// Appends events not stored yet. Returns how many were new.
    async fn record_audit_events(&self, events: Vec<AuditEvent>) -> Result<usize, StoreError>;

    async fn audit_events(&self) -> Result<Vec<AuditEvent>, StoreError>;
}

pub type SharedDeviceStore = Arc<dyn DeviceStore>;

/// Collection state shared by both store implementations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Inventory {
    #[serde(default)]
    devices: HashMap<String, DeviceRecord>,
    #[serde(default)]
    audit_events: Vec<AuditEvent>,
    #[serde(skip)]
    audit_keys: HashSet<String>,
}

impl Inventory {
    pub(crate) fn reindex(&mut self) {
        self.audit_keys = self.audit_events.iter().map(AuditEvent::dedup_key).collect();
    }

    fn upsert(&mut self, records: Vec<DeviceRecord>) -> BatchWriteOutcome {
        let mut outcome = BatchWriteOutcome::default();
        for mut record in records {
            if record.device_id.trim().is_empty() {
                outcome.failures.push(WriteFailure {
                    device_id: record.device_id,
                    reason: "empty device id".into(),
                });
                continue;
            }
            match self.devices.get(&record.device_id) {
                Some(existing) => {
                    record.created_at = existing.created_at;
                    outcome.updated += 1;
                }
                None => outcome.created += 1,
            }
            self.devices.insert(record.device_id.clone(), record);
        }
        outcome
    }

    fn mark_absent_offline(&mut self, present: &HashSet<String>, seen_since: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let mut marked = 0;
        for device in self.devices.values_mut() {
            let recently_seen = device.last_seen.is_some_and(|seen| seen >= seen_since);
            if present.contains(&device.device_id) || device.status == DeviceStatus::Offline || !recently_seen {
                continue;
            }
            device.status = DeviceStatus::Offline;
            device.updated_at = now;
            marked += 1;
        }
        marked
    }

    fn stats(&self) -> InventoryStats {
        let mut stats = InventoryStats { total: self.devices.len(), ..Default::default() };
        for device in self.devices.values() {
            match device.status {
                DeviceStatus::Online => stats.online += 1,
                DeviceStatus::Offline => stats.offline += 1,
                DeviceStatus::Unknown => stats.unknown += 1,
            }
            *stats.by_risk.entry(device.risk_level).or_insert(0) += 1;
        }
        stats
    }

    fn record_audit(&mut self, events: Vec<AuditEvent>) -> usize {
        let mut inserted = 0;
        for event in events {
            if self.audit_keys.insert(event.dedup_key()) {
                self.audit_events.push(event);
                inserted += 1;
            }
        }
        inserted
    }

    fn sorted_devices(&self) -> Vec<DeviceRecord> {
        let mut list: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.device_id.cmp(&b.device_id)));
        list
    }
}

#[derive(Default)]
pub struct MemoryDeviceStore {
    inner: RwLock<Inventory>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn upsert_batch(&self, records: Vec<DeviceRecord>) -> Result<BatchWriteOutcome, StoreError> {
        Ok(self.inner.write().await.upsert(records))
    }

    async fn mark_absent_offline(
        &self,
        present: &HashSet<String>,
        seen_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        Ok(self.inner.write().await.mark_absent_offline(present, seen_since, now))
    }

    async fn get(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.inner.read().await.devices.get(device_id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.inner.read().await.sorted_devices())
    }

    async fn stats(&self) -> Result<InventoryStats, StoreError> {
        Ok(self.inner.read().await.stats())
    }

    async fn record_audit_events(&self, events: Vec<AuditEvent>) -> Result<usize, StoreError> {
        Ok(self.inner.write().await.record_audit(events))
    }

    async fn audit_events(&self) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self.inner.read().await.audit_events.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::RiskLevel;
    use chrono::Duration;

    pub(crate) fn record(id: &str, status: DeviceStatus, last_seen: Option<DateTime<Utc>>, at: DateTime<Utc>) -> DeviceRecord {
        DeviceRecord {
            device_id: id.into(),
            name: format!("host-{id}"),
            user: "alice@example.com".into(),
            hostname: None,
            operating_system: Some("linux".into()),
            addresses: vec!["100.64.0.1".into()],
            tags: vec![],
            authorized: true,
            is_external: false,
            created: at - Duration::days(10),
            last_seen,
            key_expiry: None,
            client_version: None,
            location: None,
            status,
            risk_level: RiskLevel::Medium,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_upsert_reports_created_and_updated() {
        let store = MemoryDeviceStore::new();
        let t0 = Utc::now() - Duration::hours(1);
        let t1 = Utc::now();

        let first = store
            .upsert_batch(vec![record("a", DeviceStatus::Online, Some(t0), t0), record("b", DeviceStatus::Online, Some(t0), t0)])
            .await
            .unwrap();
        assert_eq!((first.created, first.updated), (2, 0));

        let second = store
            .upsert_batch(vec![record("a", DeviceStatus::Offline, Some(t0), t1), record("", DeviceStatus::Online, None, t1)])
            .await
            .unwrap();
        assert_eq!((second.created, second.updated, second.failures.len()), (0, 1, 1));

        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.created_at, t0);
        assert_eq!(a.updated_at, t1);
        assert_eq!(a.status, DeviceStatus::Offline);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_absent_offline_respects_grace_window() {
        let store = MemoryDeviceStore::new();
        let now = Utc::now();
        store
            .upsert_batch(vec![
                record("present", DeviceStatus::Online, Some(now - Duration::minutes(1)), now),
                record("recent", DeviceStatus::Online, Some(now - Duration::minutes(10)), now),
                record("ancient", DeviceStatus::Online, Some(now - Duration::hours(3)), now),
                record("already", DeviceStatus::Offline, Some(now - Duration::minutes(5)), now),
                record("never", DeviceStatus::Unknown, None, now),
            ])
            .await
            .unwrap();

        let present: HashSet<String> = ["present".to_string()].into();
        let later = now + Duration::seconds(5);
        let marked = store.mark_absent_offline(&present, now - Duration::minutes(30), later).await.unwrap();
        assert_eq!(marked, 1);

        let recent = store.get("recent").await.unwrap().unwrap();
        assert_eq!(recent.status, DeviceStatus::Offline);
        assert_eq!(recent.updated_at, later);
        assert_eq!(store.get("ancient").await.unwrap().unwrap().status, DeviceStatus::Online);
        assert_eq!(store.get("never").await.unwrap().unwrap().status, DeviceStatus::Unknown);

        let again = store.mark_absent_offline(&present, now - Duration::minutes(30), later).await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_stats_counts_status_and_risk() {
        let store = MemoryDeviceStore::new();
        let now = Utc::now();
        let mut critical = record("c", DeviceStatus::Offline, None, now);
        critical.risk_level = RiskLevel::Critical;
        store
            .upsert_batch(vec![record("a", DeviceStatus::Online, Some(now), now), critical])
            .await
            .unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!((stats.total, stats.online, stats.offline, stats.unknown), (2, 1, 1, 0));
        assert_eq!(stats.by_risk.get(&RiskLevel::Critical), Some(&1));
        assert_eq!(stats.by_risk.get(&RiskLevel::Medium), Some(&1));
    }

    #[tokio::test]
    async fn test_audit_events_are_deduplicated() {
        let store = MemoryDeviceStore::new();
        let now = Utc::now();
        let event = |target: &str| AuditEvent {
            event_time: now,
            action: "CREATE".into(),
            actor: Some("alice".into()),
            target: Some(target.into()),
            raw: serde_json::json!({}),
            ingested_at: now,
        };
        assert_eq!(store.record_audit_events(vec![event("n1"), event("n2")]).await.unwrap(), 2);
        assert_eq!(store.record_audit_events(vec![event("n2"), event("n3")]).await.unwrap(), 1);
        assert_eq!(store.audit_events().await.unwrap().len(), 3);
    }
}
