/**
 * UPSTREAM CLIENT - Accès à l'API du réseau maillé (devices + audit)
 *
 * ROLE :
 * Fetches the raw device list and the recent audit activity from the
 * upstream control plane. Records come back as untyped JSON; validation
 * happens later in the pipeline.
 *
 * RETRY :
 * 5xx, timeouts and connection failures are retried with exponential
 * backoff (base, 2x base, 4x base...) up to `max_retries` extra attempts.
 * 4xx answers fail immediately.
 */

use crate::config::UpstreamConf;
use crate::models::AuditEvent;
use crate::validation::parse_time;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const AUDIT_PAGE_SIZE: usize = 100;
/// Hard stop for audit pagination.
const AUDIT_MAX_PAGES: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unexpected upstream payload: {0}")]
    Payload(String),
    #[error("upstream API key is not configured")]
    MissingCredential,
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            UpstreamError::Status { status, .. } => status.is_server_error(),
            UpstreamError::Payload(_) | UpstreamError::MissingCredential => false,
        }
    }
}

/// Where the engine gets its raw records.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn fetch_devices(&self) -> Result<Vec<Value>, UpstreamError>;

    async fn fetch_audit_events(&self, since: DateTime<Utc>) -> Result<Vec<AuditEvent>, UpstreamError>;
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    tailnet: String,
    api_key: Option<String>,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl UpstreamClient {
    pub fn new(conf: &UpstreamConf) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: conf.base_url.trim_end_matches('/').to_string(),
            tailnet: conf.tailnet.clone(),
            api_key: conf.api_key.clone(),
            max_retries: conf.max_retries,
            retry_base_delay: Duration::from_millis(conf.retry_base_delay_ms),
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/tailnet/{}/{}", self.base_url, self.tailnet, suffix)
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, UpstreamError> {
        let key = self.api_key.as_deref().ok_or(UpstreamError::MissingCredential)?;
        let response = self.http.get(url).bearer_auth(key).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    async fn get_with_retry(&self, url: &str, query: &[(&str, String)]) -> Result<Value, UpstreamError> {
        let mut attempt = 0;
        loop {
            match self.get_json(url, query).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.retry_base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(url, attempt, max = self.max_retries, delay_ms = delay.as_millis() as u64, error = %e, "upstream call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl DeviceSource for UpstreamClient {
    async fn fetch_devices(&self) -> Result<Vec<Value>, UpstreamError> {
        let body = self.get_with_retry(&self.url("devices"), &[]).await?;
        let devices = match body {
            Value::Object(mut map) => match map.remove("devices") {
                Some(Value::Array(devices)) => devices,
                Some(Value::Null) | None => Vec::new(),
                Some(other) => return Err(UpstreamError::Payload(format!("'devices' is not a list: {other}"))),
            },
            other => return Err(UpstreamError::Payload(format!("expected an object, got {other}"))),
        };
        info!(count = devices.len(), "fetched upstream devices");
        Ok(devices)
    }

    async fn fetch_audit_events(&self, since: DateTime<Utc>) -> Result<Vec<AuditEvent>, UpstreamError> {
        let url = self.url("audit/logs");
        let since_param = since.to_rfc3339_opts(SecondsFormat::Millis, true);
        let ingested_at = Utc::now();
        let mut events = Vec::new();

        for page in 0..AUDIT_MAX_PAGES {
            let query = [
                ("limit", AUDIT_PAGE_SIZE.to_string()),
                ("offset", (page * AUDIT_PAGE_SIZE).to_string()),
                ("since", since_param.clone()),
            ];
            let entries = audit_entries(self.get_with_retry(&url, &query).await?)?;
            let short_page = entries.len() < AUDIT_PAGE_SIZE;
            events.extend(entries.into_iter().filter_map(|raw| audit_event_from(raw, ingested_at)));
            if short_page {
                break;
            }
        }
        debug!(count = events.len(), "fetched upstream audit events");
        Ok(events)
    }
}

fn audit_entries(body: Value) -> Result<Vec<Value>, UpstreamError> {
    match body {
        Value::Array(entries) => Ok(entries),
        Value::Null => Ok(Vec::new()),
        Value::Object(mut map) => match map.remove("logs") {
            Some(Value::Array(entries)) => Ok(entries),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(UpstreamError::Payload(format!("'logs' is not a list: {other}"))),
        },
        other => Err(UpstreamError::Payload(format!("unexpected audit payload: {other}"))),
    }
}

fn first_str(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| raw.get(*k))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(o) => o
                .get("loginName")
                .or_else(|| o.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
}

/// Entries without a timestamp or an action are dropped.
fn audit_event_from(raw: Value, ingested_at: DateTime<Utc>) -> Option<AuditEvent> {
    let event_time = ["eventTime", "timestamp", "time"]
        .iter()
        .find_map(|k| raw.get(*k).and_then(parse_time))?;
    let action = first_str(&raw, &["action", "type", "event"])?;
    let actor = first_str(&raw, &["actor", "user"]);
    let target = first_str(&raw, &["target", "node_id", "nodeId"]);
    Some(AuditEvent { event_time, action, actor, target, raw, ingested_at })
}
