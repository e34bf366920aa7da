/*!
Recorder of published sync events

Subscribes to the kernel event bus and keeps every event together with the
MQTT topic and JSON payload the forwarder would send, so tests can assert on
wire output without a broker.
*/

use anyhow::Result;
use inventory_kernel::events::{SharedEventBus, SyncEvent};
use inventory_kernel::mqtt::topic_for;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub topic: String,
    pub event: SyncEvent,
    pub payload: Value,
}

pub struct EventRecorder {
    messages: Arc<Mutex<Vec<RecordedMessage>>>,
    task: JoinHandle<()>,
}

impl EventRecorder {
    pub fn attach(bus: &SharedEventBus) -> Self {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let mut rx = bus.subscribe();
        let sink = messages.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let payload = event.payload().unwrap_or(Value::Null);
                        sink.lock().push(RecordedMessage { topic: topic_for(&event).to_string(), event, payload });
                    }
                    Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "recorder lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self { messages, task }
    }

    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.messages.lock().clone()
    }

    pub fn find_by_topic(&self, topic: &str) -> Vec<RecordedMessage> {
        self.messages.lock().iter().filter(|m| m.topic == topic).cloned().collect()
    }

    pub fn last_payload(&self, topic: &str) -> Option<Value> {
        self.find_by_topic(topic).pop().map(|m| m.payload)
    }

    /// Payloads of every `sync_status` event with the given `status` value.
    pub fn statuses(&self, status: &str) -> Vec<Value> {
        self.find_by_topic(inventory_kernel::mqtt::SYNC_STATUS_TOPIC)
            .into_iter()
            .map(|m| m.payload)
            .filter(|p| p["status"] == status)
            .collect()
    }

    /// Waits until `topic` has at least `count` messages.
    pub async fn wait_for(&self, topic: &str, count: usize, timeout: Duration) -> Result<Vec<RecordedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self.find_by_topic(topic);
            if found.len() >= count {
                return Ok(found);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("expected {count} messages on {topic}, got {}", found.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
