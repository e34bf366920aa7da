//! Schema check and normalisation of raw upstream device records.
//!
//! Validation never fails as a whole: each record is either normalised into a
//! [`ValidDevice`] or reported with every field error found. Fields the
//! upstream adds over time are ignored.

use crate::models::ValidDevice;
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::sync::LazyLock;

static DEVICE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));
static USER_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*$").expect("static regex")
});

const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 50;
const MAX_CLIENT_VERSION_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self { field: field.to_string(), message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRecord {
    pub record: Value,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid_records: Vec<ValidDevice>,
    pub invalid_records: Vec<InvalidRecord>,
    pub total_count: usize,
    pub valid_count: usize,
    pub invalid_count: usize,
}

pub fn validate_batch(records: &[Value]) -> ValidationReport {
    let mut report = ValidationReport { total_count: records.len(), ..Default::default() };
    for raw in records {
        match validate_device(raw) {
            Ok(device) => report.valid_records.push(device),
            Err(errors) => report.invalid_records.push(InvalidRecord { record: raw.clone(), errors }),
        }
    }
    report.valid_count = report.valid_records.len();
    report.invalid_count = report.invalid_records.len();
    report
}

/// Collects every error instead of stopping at the first one.
pub fn validate_device(raw: &Value) -> Result<ValidDevice, Vec<FieldError>> {
    let Some(obj) = raw.as_object() else {
        return Err(vec![FieldError::new("record", "must be an object")]);
    };
    let mut errors = Vec::new();

    let device_id = required_str(obj, &["id", "deviceId"], &mut errors).and_then(|id| {
        if DEVICE_ID.is_match(&id) {
            Some(id)
        } else {
            errors.push(FieldError::new("id", "must only contain letters, digits, '_' or '-'"));
            None
        }
    });

    let name = required_str(obj, &["name"], &mut errors).and_then(|name| {
        if name.chars().count() > MAX_NAME_LEN {
            errors.push(FieldError::new("name", format!("must be at most {MAX_NAME_LEN} characters")));
            None
        } else {
            Some(name)
        }
    });

    let user = required_str(obj, &["user"], &mut errors).and_then(|user| {
        if USER_ID.is_match(&user) {
            Some(user)
        } else {
            errors.push(FieldError::new("user", "must be a login identifier like name@domain"));
            None
        }
    });

    let hostname = optional_str(obj, &["hostname"], MAX_NAME_LEN, &mut errors);
    let operating_system = optional_str(obj, &["os", "operatingSystem"], MAX_NAME_LEN, &mut errors);
    let client_version = optional_str(obj, &["clientVersion"], MAX_CLIENT_VERSION_LEN, &mut errors);

    let addresses = optional_str_list(obj, "addresses", &mut errors, |field, value| {
        value
            .parse::<IpAddr>()
            .map(|_| ())
            .map_err(|_| FieldError::new(field, format!("'{value}' is not a valid IPv4 or IPv6 address")))
    });
    let tags = optional_str_list(obj, "tags", &mut errors, |field, value| {
        if value.chars().count() > MAX_TAG_LEN {
            Err(FieldError::new(field, format!("must be at most {MAX_TAG_LEN} characters")))
        } else {
            Ok(())
        }
    });

    let authorized = required_bool(obj, "authorized", &mut errors);
    let is_external = required_bool(obj, "isExternal", &mut errors);

    let created = required_time(obj, "created", &mut errors);
    let last_seen = required_time(obj, "lastSeen", &mut errors);

    let expiry_disabled = obj.get("keyExpiryDisabled").and_then(Value::as_bool).unwrap_or(false);
    let key_expiry = match lookup(obj, &["expires", "keyExpiry"]) {
        None | Some(Value::Null) => None,
        Some(value) => match parse_time(value) {
            Some(t) if expiry_disabled || is_zero_time(t) => None,
            Some(t) => Some(t),
            None => {
                errors.push(FieldError::new("expires", "must be a timestamp or null"));
                None
            }
        },
    };

    match (device_id, name, user, authorized, is_external, created, last_seen) {
        (Some(device_id), Some(name), Some(user), Some(authorized), Some(is_external), Some(created), Some(last_seen))
            if errors.is_empty() =>
        {
            Ok(ValidDevice {
                device_id,
                name,
                user,
                hostname,
                operating_system,
                addresses,
                tags,
                authorized,
                is_external,
                created,
                last_seen: Some(last_seen),
                key_expiry,
                client_version,
            })
        }
        _ => Err(errors),
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn required_str(obj: &Map<String, Value>, keys: &[&str], errors: &mut Vec<FieldError>) -> Option<String> {
    match lookup(obj, keys) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::String(_)) => {
            errors.push(FieldError::new(keys[0], "must not be empty"));
            None
        }
        Some(Value::Null) | None => {
            errors.push(FieldError::new(keys[0], "is required"));
            None
        }
        Some(_) => {
            errors.push(FieldError::new(keys[0], "must be a string"));
            None
        }
    }
}

fn optional_str(
    obj: &Map<String, Value>,
    keys: &[&str],
    max_len: usize,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match lookup(obj, keys) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.chars().count() <= max_len => Some(s.clone()),
        Some(Value::String(_)) => {
            errors.push(FieldError::new(keys[0], format!("must be at most {max_len} characters")));
            None
        }
        Some(_) => {
            errors.push(FieldError::new(keys[0], "must be a string"));
            None
        }
    }
}

fn optional_str_list<F>(obj: &Map<String, Value>, key: &str, errors: &mut Vec<FieldError>, check: F) -> Vec<String>
where
    F: Fn(&str, &str) -> Result<(), FieldError>,
{
    let items = match obj.get(key) {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            errors.push(FieldError::new(key, "must be an array"));
            return Vec::new();
        }
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let field = format!("{key}[{i}]");
        match item.as_str() {
            Some(value) => match check(&field, value) {
                Ok(()) => out.push(value.to_string()),
                Err(e) => errors.push(e),
            },
            None => errors.push(FieldError::new(&field, "must be a string")),
        }
    }
    out
}

fn required_bool(obj: &Map<String, Value>, key: &str, errors: &mut Vec<FieldError>) -> Option<bool> {
    match obj.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        None | Some(Value::Null) => {
            errors.push(FieldError::new(key, "is required"));
            None
        }
        Some(_) => {
            errors.push(FieldError::new(key, "must be a boolean"));
            None
        }
    }
}

fn required_time(obj: &Map<String, Value>, key: &str, errors: &mut Vec<FieldError>) -> Option<DateTime<Utc>> {
    match obj.get(key) {
        None | Some(Value::Null) => {
            errors.push(FieldError::new(key, "is required"));
            None
        }
        Some(value) => {
            let parsed = parse_time(value);
            if parsed.is_none() {
                errors.push(FieldError::new(key, "must be an RFC 3339 timestamp or epoch milliseconds"));
            }
            parsed
        }
    }
}

/// RFC 3339 strings or integer epoch milliseconds.
pub fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Upstream encodes "never expires" as the zero time `0001-01-01T00:00:00Z`.
fn is_zero_time(t: DateTime<Utc>) -> bool {
    t.year() <= 1
}
