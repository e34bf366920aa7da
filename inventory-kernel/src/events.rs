//! In-process publish/subscribe for sync notifications.
//!
//! The orchestrator publishes; transports (MQTT forwarder, tests) subscribe.
//! A slow subscriber lags and loses the oldest events, it never blocks a sync.

use crate::models::{DeviceRecord, InventoryStats, SyncKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusEvent {
    pub status: SyncState,
    pub last_sync_time: DateTime<Utc>,
    pub created: usize,
    pub updated: usize,
    pub offline: usize,
    pub invalid: usize,
    pub sync_type: SyncKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdateEvent {
    pub update_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceRecord>,
    pub aggregate_stats: InventoryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStatus(SyncStatusEvent),
    DeviceUpdate(DeviceUpdateEvent),
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStatus(_) => "sync_status",
            SyncEvent::DeviceUpdate(_) => "device_update",
        }
    }

    /// Body without the `type` tag, as sent on the wire.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            SyncEvent::SyncStatus(ev) => serde_json::to_value(ev),
            SyncEvent::DeviceUpdate(ev) => serde_json::to_value(ev),
        }
    }
}

pub struct EventBus {
    chan: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { chan: broadcast::channel(CHANNEL_CAPACITY).0 })
    }

    pub fn publish(&self, event: SyncEvent) {
        trace!(event = event.name(), subscribers = self.chan.receiver_count(), "publishing");
        if self.chan.receiver_count() > 0 {
            self.chan.send(event).ok();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.chan.subscribe()
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: SyncState, error: Option<String>) -> SyncEvent {
        SyncEvent::SyncStatus(SyncStatusEvent {
            status: state,
            last_sync_time: Utc::now(),
            created: 1,
            updated: 2,
            offline: 0,
            invalid: 3,
            sync_type: SyncKind::Auto,
            error,
        })
    }

    #[test]
    fn test_status_payload_shape() {
        let payload = status(SyncState::Error, Some("upstream down".into())).payload().unwrap();
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["syncType"], "auto");
        assert_eq!(payload["error"], "upstream down");
        assert!(payload.get("lastSyncTime").is_some());
        assert!(payload.get("type").is_none());

        let ok = status(SyncState::Success, None).payload().unwrap();
        assert!(ok.get("error").is_none());
    }

    #[test]
    fn test_tagged_serialization() {
        let value = serde_json::to_value(status(SyncState::Running, None)).unwrap();
        assert_eq!(value["type"], "sync_status");
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        // nobody listening: dropped silently
        bus.publish(status(SyncState::Running, None));

        let mut rx = bus.subscribe();
        bus.publish(status(SyncState::Running, None));
        bus.publish(status(SyncState::Success, None));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, SyncEvent::SyncStatus(SyncStatusEvent { status: SyncState::Running, .. })));
        assert!(matches!(second, SyncEvent::SyncStatus(SyncStatusEvent { status: SyncState::Success, .. })));
    }
}
