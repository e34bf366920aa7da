use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Connectivity state derived from `last_seen` at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

/// Risk classification derived from the raw upstream fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

/// Upstream device after validation, before enrichment.
/// Unknown upstream fields are already gone at this point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidDevice {
    pub device_id: String,
    pub name: String,
    pub user: String,
    pub hostname: Option<String>,
    pub operating_system: Option<String>,
    pub addresses: Vec<String>,
    pub tags: Vec<String>,
    pub authorized: bool,
    pub is_external: bool,
    pub created: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub key_expiry: Option<DateTime<Utc>>,
    pub client_version: Option<String>,
}

/// Persisted inventory entry, one per upstream device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub user: String,
    pub hostname: Option<String>,
    pub operating_system: Option<String>,
    pub addresses: Vec<String>,
    pub tags: Vec<String>,
    pub authorized: bool,
    pub is_external: bool,
    pub created: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub key_expiry: Option<DateTime<Utc>>,
    pub client_version: Option<String>,
    pub location: Option<Location>,
    pub status: DeviceStatus,
    pub risk_level: RiskLevel,
    /// First local write; kept across updates.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counts over the whole collection, shipped with `device_update` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub unknown: usize,
    pub by_risk: HashMap<RiskLevel, usize>,
}

/// Upstream activity record kept by the best-effort audit sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_time: DateTime<Utc>,
    pub action: String,
    pub actor: Option<String>,
    pub target: Option<String>,
    pub raw: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Identity used for deduplication across audit syncs.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.event_time.timestamp_millis(),
            self.action,
            self.target.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Auto,
    Manual,
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncKind::Auto => write!(f, "auto"),
            SyncKind::Manual => write!(f, "manual"),
        }
    }
}

/// Lease on the reconciliation. At most one live instance system-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLock {
    pub lock_id: String,
    pub kind: SyncKind,
    pub acquired_at: DateTime<Utc>,
    pub lease_duration_ms: u64,
    pub owner_process_id: u32,
}

impl SyncLock {
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.acquired_at).num_milliseconds()
    }

    /// Live iff `now - acquired_at < lease_duration_ms`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.age_ms(now) < self.lease_duration_ms as i64
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_live(now)
    }
}

/// Outcome of one reconciliation, returned to callers and published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub kind: SyncKind,
    pub lock_id: String,
    pub created: usize,
    pub updated: usize,
    pub offline: usize,
    pub invalid: usize,
    pub write_failures: usize,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lock_at(acquired_at: DateTime<Utc>, lease_ms: u64) -> SyncLock {
        SyncLock {
            lock_id: "sync_1_abc".into(),
            kind: SyncKind::Auto,
            acquired_at,
            lease_duration_ms: lease_ms,
            owner_process_id: 42,
        }
    }

    #[test]
    fn test_lock_liveness_boundary() {
        let now = Utc::now();
        let lock = lock_at(now - Duration::milliseconds(999), 1000);
        assert!(lock.is_live(now));
        let lock = lock_at(now - Duration::milliseconds(1000), 1000);
        assert!(lock.is_expired(now));
    }

    #[test]
    fn test_enums_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&DeviceStatus::Online).unwrap(), "\"online\"");
        assert_eq!(serde_json::to_string(&RiskLevel::Critical).unwrap(), "\"critical\"");
        assert_eq!(serde_json::to_string(&SyncKind::Manual).unwrap(), "\"manual\"");
    }

    #[test]
    fn test_lock_wire_format_is_camel_case() {
        let value = serde_json::to_value(lock_at(Utc::now(), 5000)).unwrap();
        assert!(value.get("lockId").is_some());
        assert!(value.get("leaseDurationMs").is_some());
        assert!(value.get("ownerProcessId").is_some());
    }
}
