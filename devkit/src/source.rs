use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inventory_kernel::models::AuditEvent;
use inventory_kernel::upstream::{DeviceSource, UpstreamError};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Scripted upstream. Serves `devices` unless a queued failure is pending;
/// can be paused so a sync stays inside the fetch phase while holding the lock.
#[derive(Default)]
pub struct FakeDeviceSource {
    devices: Mutex<Vec<Value>>,
    failures: Mutex<VecDeque<StatusCode>>,
    audit: Mutex<Vec<AuditEvent>>,
    audit_fails: AtomicBool,
    paused: AtomicBool,
    entered: Arc<Notify>,
    resume: Arc<Notify>,
    fetches: AtomicUsize,
}

impl FakeDeviceSource {
    pub fn new(devices: Vec<Value>) -> Self {
        Self { devices: Mutex::new(devices), ..Default::default() }
    }

    pub fn set_devices(&self, devices: Vec<Value>) {
        *self.devices.lock() = devices;
    }

    /// Next fetch answers `status` (after any already queued).
    pub fn fail_next(&self, status: u16) {
        if let Ok(status) = StatusCode::from_u16(status) {
            self.failures.lock().push_back(status);
        }
    }

    pub fn set_audit_events(&self, events: Vec<AuditEvent>) {
        *self.audit.lock() = events;
    }

    pub fn fail_audit(&self, fail: bool) {
        self.audit_fails.store(fail, Ordering::SeqCst);
    }

    /// Following fetches block until `resume`.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_one();
    }

    /// Resolves once a fetch is blocked on the pause.
    pub async fn wait_until_fetching(&self) {
        self.entered.notified().await;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceSource for FakeDeviceSource {
    async fn fetch_devices(&self) -> Result<Vec<Value>, UpstreamError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.paused.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.resume.notified().await;
        }
        if let Some(status) = self.failures.lock().pop_front() {
            return Err(UpstreamError::Status { status, body: "scripted failure".into() });
        }
        Ok(self.devices.lock().clone())
    }

    async fn fetch_audit_events(&self, since: DateTime<Utc>) -> Result<Vec<AuditEvent>, UpstreamError> {
        if self.audit_fails.load(Ordering::SeqCst) {
            return Err(UpstreamError::Payload("scripted audit failure".into()));
        }
        Ok(self.audit.lock().iter().filter(|e| e.event_time >= since).cloned().collect())
    }
}
