//! Raw upstream records shaped like the control-plane device API.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Value};

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builds one upstream device. Defaults: authorized, internal, linux, seen
/// one minute before `now`, overlay-only address, no key expiry.
#[derive(Debug, Clone)]
pub struct UpstreamDeviceBuilder {
    record: Value,
    now: DateTime<Utc>,
}

impl UpstreamDeviceBuilder {
    pub fn new(id: &str, now: DateTime<Utc>) -> Self {
        let record = json!({
            "id": id,
            "name": format!("{id}.example.ts.net"),
            "hostname": id,
            "user": "alice@example.com",
            "os": "linux",
            "addresses": ["100.64.0.10"],
            "tags": [],
            "authorized": true,
            "isExternal": false,
            "created": ts(now - Duration::days(30)),
            "lastSeen": ts(now - Duration::minutes(1)),
            "expires": "0001-01-01T00:00:00Z",
            "keyExpiryDisabled": true,
            "clientVersion": "1.70.0",
        });
        Self { record, now }
    }

    fn set(mut self, key: &str, value: Value) -> Self {
        if let Some(obj) = self.record.as_object_mut() {
            obj.insert(key.to_string(), value);
        }
        self
    }

    pub fn addresses(self, addresses: &[&str]) -> Self {
        self.set("addresses", json!(addresses))
    }

    pub fn last_seen_ago(self, ago: Duration) -> Self {
        let at = self.now - ago;
        self.set("lastSeen", json!(ts(at)))
    }

    pub fn external(self, external: bool) -> Self {
        self.set("isExternal", json!(external))
    }

    pub fn authorized(self, authorized: bool) -> Self {
        self.set("authorized", json!(authorized))
    }

    pub fn os(self, os: &str) -> Self {
        self.set("os", json!(os))
    }

    pub fn key_expired_ago(self, ago: Duration) -> Self {
        let at = self.now - ago;
        self.set("expires", json!(ts(at))).set("keyExpiryDisabled", json!(false))
    }

    pub fn field(self, key: &str, value: Value) -> Self {
        self.set(key, value)
    }

    pub fn build(self) -> Value {
        self.record
    }
}

/// `count` healthy devices named `node-0..`.
pub fn fleet(count: usize, now: DateTime<Utc>) -> Vec<Value> {
    (0..count)
        .map(|i| UpstreamDeviceBuilder::new(&format!("node-{i}"), now).build())
        .collect()
}
