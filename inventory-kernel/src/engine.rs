/**
 * ATOMIC SYNC ENGINE - Réconciliation upstream → inventaire
 *
 * ROLE :
 * One reconciliation pass, run by the orchestrator while it holds the sync
 * lock. Never called concurrently with itself.
 *
 * PHASES :
 * Fetching → Validating → Enriching → Writing → MarkingStale → Done | Failed
 * - Fetching : upstream device list (client-side retry/backoff)
 * - Validating : invalid records are dropped and counted; zero valid fails
 * - Enriching : location, status, risk
 * - Writing : fixed-size batches in order, per-record failures counted only
 * - MarkingStale : absent devices seen within the grace window go offline
 * - Done : then best-effort audit log sync, errors only logged
 */

use crate::enrich::StateEnricher;
use crate::models::DeviceRecord;
use crate::state::SharedClock;
use crate::store::SharedDeviceStore;
use crate::upstream::DeviceSource;
use crate::validation::validate_batch;
use chrono::Duration;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Validating,
    Enriching,
    Writing,
    MarkingStale,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Validating => "validating",
            SyncPhase::Enriching => "enriching",
            SyncPhase::Writing => "writing",
            SyncPhase::MarkingStale => "marking_stale",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sync failed while {phase}: {reason}")]
pub struct SyncFailure {
    pub phase: SyncPhase,
    pub reason: String,
    /// Records rejected by validation before the failure, if it got that far.
    pub invalid: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub offline: usize,
    pub invalid: usize,
    pub write_failures: usize,
    pub audit_inserted: usize,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub batch_size: usize,
    pub stale_grace: Duration,
    /// `None` disables the audit log sync.
    pub audit_lookback: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            stale_grace: Duration::minutes(30),
            audit_lookback: Some(Duration::days(1)),
        }
    }
}

pub struct AtomicSyncEngine {
    source: Arc<dyn DeviceSource>,
    enricher: Arc<StateEnricher>,
    store: SharedDeviceStore,
    clock: SharedClock,
    opts: EngineOptions,
    phase: Mutex<SyncPhase>,
}

impl AtomicSyncEngine {
    pub fn new(
        source: Arc<dyn DeviceSource>,
        enricher: Arc<StateEnricher>,
        store: SharedDeviceStore,
        clock: SharedClock,
        opts: EngineOptions,
    ) -> Self {
        Self { source, enricher, store, clock, opts, phase: Mutex::new(SyncPhase::Idle) }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn store(&self) -> &SharedDeviceStore {
        &self.store
    }

    fn enter(&self, phase: SyncPhase) {
        debug!(%phase, "sync phase");
        *self.phase.lock() = phase;
    }

    fn fail(&self, reason: impl Into<String>) -> SyncFailure {
        let phase = self.phase();
        self.enter(SyncPhase::Failed);
        SyncFailure { phase, reason: reason.into(), invalid: 0 }
    }

    pub async fn run(&self) -> Result<SyncReport, SyncFailure> {
        let mut report = SyncReport::default();

        self.enter(SyncPhase::Fetching);
        let raw = self
            .source
            .fetch_devices()
            .await
            .map_err(|e| self.fail(format!("upstream fetch failed: {e}")))?;
        report.fetched = raw.len();

        self.enter(SyncPhase::Validating);
        let validation = validate_batch(&raw);
        report.invalid = validation.invalid_count;
        for invalid in &validation.invalid_records {
            let id = invalid.record.get("id").or_else(|| invalid.record.get("deviceId"));
            let fields: Vec<&str> = invalid.errors.iter().map(|e| e.field.as_str()).collect();
            warn!(device = ?id, ?fields, "dropping invalid upstream record");
        }
        if validation.valid_count == 0 {
            return Err(SyncFailure {
                invalid: validation.invalid_count,
                ..self.fail(format!(
                    "no valid devices in upstream response ({} received, {} invalid)",
                    validation.total_count, validation.invalid_count
                ))
            });
        }
        info!(valid = validation.valid_count, invalid = validation.invalid_count, "upstream records validated");

        self.enter(SyncPhase::Enriching);
        let now = self.clock.now();
        let mut records: Vec<DeviceRecord> = Vec::with_capacity(validation.valid_count);
        for device in validation.valid_records {
            records.push(self.enricher.enrich(device, now).await);
        }
        let present: HashSet<String> = records.iter().map(|r| r.device_id.clone()).collect();

        self.enter(SyncPhase::Writing);
        let batch_size = self.opts.batch_size.max(1);
        let mut pending = records.into_iter().peekable();
        let mut batch_no = 0;
        while pending.peek().is_some() {
            let batch: Vec<DeviceRecord> = pending.by_ref().take(batch_size).collect();
            let size = batch.len();
            batch_no += 1;
            match self.store.upsert_batch(batch).await {
                Ok(outcome) => {
                    report.created += outcome.created;
                    report.updated += outcome.updated;
                    report.write_failures += outcome.failures.len();
                    for failure in &outcome.failures {
                        warn!(device = %failure.device_id, reason = %failure.reason, "device write failed");
                    }
                }
                Err(e) => {
                    report.write_failures += size;
                    error!(batch = batch_no, size, error = %e, "batch write failed");
                }
            }
        }

        self.enter(SyncPhase::MarkingStale);
        let marked_at = self.clock.now();
        match self
            .store
            .mark_absent_offline(&present, marked_at - self.opts.stale_grace, marked_at)
            .await
        {
            Ok(marked) => report.offline = marked,
            Err(e) => error!(error = %e, "failed to mark absent devices offline"),
        }

        self.enter(SyncPhase::Done);
        info!(
            created = report.created,
            updated = report.updated,
            offline = report.offline,
            invalid = report.invalid,
            write_failures = report.write_failures,
            "device sync done"
        );

        report.audit_inserted = self.sync_audit_log().await;
        Ok(report)
    }

    /// Pulls recent upstream activity into the store. Never fails the sync.
    pub async fn sync_audit_log(&self) -> usize {
        let Some(lookback) = self.opts.audit_lookback else {
            return 0;
        };
        let since = self.clock.now() - lookback;
        let events = match self.source.fetch_audit_events(since).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "audit log sync failed");
                return 0;
            }
        };
        let fetched = events.len();
        match self.store.record_audit_events(events).await {
            Ok(inserted) => {
                info!(fetched, inserted, "audit log synced");
                inserted
            }
            Err(e) => {
                warn!(error = %e, "failed to store audit events");
                0
            }
        }
    }
}
