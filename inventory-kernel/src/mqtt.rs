/**
 * MQTT FORWARDER - Diffusion des événements de sync sur le broker
 *
 * ROLE :
 * Subscribes to the in-process event bus and republishes every event as
 * JSON on its versioned topic. Dashboards listen there.
 *
 * TOPICS :
 * - inventory/sync/status@v1 : sync_status
 * - inventory/devices/update@v1 : device_update
 */

use crate::config::MqttConf;
use crate::events::{SharedEventBus, SyncEvent};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, warn};

pub const SYNC_STATUS_TOPIC: &str = "inventory/sync/status@v1";
pub const DEVICE_UPDATE_TOPIC: &str = "inventory/devices/update@v1";

pub fn topic_for(event: &SyncEvent) -> &'static str {
    match event {
        SyncEvent::SyncStatus(_) => SYNC_STATUS_TOPIC,
        SyncEvent::DeviceUpdate(_) => DEVICE_UPDATE_TOPIC,
    }
}

pub fn spawn_mqtt_forwarder(conf: MqttConf, bus: SharedEventBus) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    task::spawn(async move {
        let mut opts = MqttOptions::new("inventory-kernel", &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => forward(&client, &event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "mqtt forwarder lagging, events dropped"),
                    Err(RecvError::Closed) => break,
                },
                polled = eventloop.poll() => {
                    if let Err(e) = polled {
                        error!(host = %conf.host, port = conf.port, error = ?e, "MQTT connection error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
        debug!("event bus closed, mqtt forwarder exiting");
    })
}

// try_publish: awaiting here would stall the event loop polled by the same task
fn forward(client: &AsyncClient, event: &SyncEvent) {
    let payload = match event.payload() {
        Ok(payload) => payload.to_string(),
        Err(e) => {
            error!(event = event.name(), error = %e, "cannot encode event");
            return;
        }
    };
    let topic = topic_for(event);
    match client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
        Ok(()) => debug!(topic, "event forwarded"),
        Err(e) => warn!(topic, error = ?e, "failed to publish event"),
    }
}
