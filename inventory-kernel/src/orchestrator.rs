/**
 * SYNC ORCHESTRATOR - Point d'entrée unique des synchronisations
 *
 * ROLE :
 * Wraps the engine with the single-flight guard, the cluster-wide lease and
 * status publication. Every trigger (HTTP manual sync, auto sync timer)
 * goes through `run_protected`.
 *
 * REGLES :
 * - one sync at a time per process (in-flight flag), and system-wide (lock)
 * - manual syncs may pre-empt an auto sync holding the lock for too long
 * - the lock is always released, including when the engine fails
 * - `sync_status` events at start, success and failure; `device_update`
 *   after a successful sync that changed the inventory
 */

use crate::engine::{AtomicSyncEngine, SyncPhase};
use crate::events::{DeviceUpdateEvent, SharedEventBus, SyncEvent, SyncState, SyncStatusEvent};
use crate::lock::{AcquireOutcome, LockError, LockManager};
use crate::models::{SyncKind, SyncLock, SyncResult};
use crate::state::SharedClock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("a sync is already running in this process")]
    InProgress,
    #[error("sync lock held by a {kind} sync for {age_ms} ms")]
    LockConflict { kind: SyncKind, age_ms: i64, lock_id: String },
    #[error("sync lock unavailable: {0}")]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub auto_lease_ms: u64,
    pub manual_lease_ms: u64,
    pub preempt_auto_after_ms: u64,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            auto_lease_ms: 10 * 60 * 1000,
            manual_lease_ms: 5 * 60 * 1000,
            preempt_auto_after_ms: 2 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusView {
    pub in_progress: bool,
    pub phase: SyncPhase,
    pub lock: Option<SyncLock>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_result: Option<SyncResult>,
    pub can_sync: bool,
    pub auto_sync_running: bool,
    pub auto_interval_secs: Option<u64>,
    pub lock_backend: &'static str,
}

/// Shortest auto sync period accepted; `tokio::time::interval` rejects zero.
pub const MIN_AUTO_INTERVAL: Duration = Duration::from_secs(1);

struct AutoSync {
    handle: JoinHandle<()>,
    interval: Duration,
    // ends the timer loop between ticks, never a running sync
    stop: watch::Sender<bool>,
}

impl AutoSync {
    fn stop(self) -> JoinHandle<()> {
        let _ = self.stop.send(true);
        self.handle
    }
}

/// Clears the in-flight flag on every exit path.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Held lease. Released explicitly on the normal path; if the sync future is
/// dropped before that, the release is spawned.
struct LeaseGuard {
    locks: Arc<LockManager>,
    lock_id: Option<String>,
}

impl LeaseGuard {
    async fn release(mut self) {
        if let Some(lock_id) = self.lock_id.take() {
            self.locks.release(&lock_id).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lock_id) = self.lock_id.take() else {
            return;
        };
        let locks = self.locks.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    locks.release(&lock_id).await;
                });
            }
            Err(_) => warn!(lock_id = %lock_id, "no runtime to release lock, lease will expire"),
        }
    }
}

pub struct SyncOrchestrator {
    engine: AtomicSyncEngine,
    locks: Arc<LockManager>,
    events: SharedEventBus,
    clock: SharedClock,
    opts: OrchestratorOptions,
    in_flight: AtomicBool,
    last_result: Mutex<Option<SyncResult>>,
    last_sync_time: Mutex<Option<DateTime<Utc>>>,
    auto: Mutex<Option<AutoSync>>,
}

impl SyncOrchestrator {
    pub fn new(
        engine: AtomicSyncEngine,
        locks: Arc<LockManager>,
        events: SharedEventBus,
        clock: SharedClock,
        opts: OrchestratorOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            locks,
            events,
            clock,
            opts,
            in_flight: AtomicBool::new(false),
            last_result: Mutex::new(None),
            last_sync_time: Mutex::new(None),
            auto: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn last_result(&self) -> Option<SyncResult> {
        self.last_result.lock().clone()
    }

    fn lease_for(&self, kind: SyncKind) -> u64 {
        match kind {
            SyncKind::Auto => self.opts.auto_lease_ms,
            SyncKind::Manual => self.opts.manual_lease_ms,
        }
    }

    pub async fn manual_sync(&self) -> Result<SyncResult, SyncError> {
        self.run_protected(SyncKind::Manual).await
    }

    /// Rejections (already running, lock held elsewhere) are `Err`. A sync
    /// that started and then failed is `Ok` with `success == false`.
    pub async fn run_protected(&self, kind: SyncKind) -> Result<SyncResult, SyncError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(%kind, "sync already in progress, skipping");
            return Err(SyncError::InProgress);
        }
        let _in_flight = InFlight(&self.in_flight);

        let lock = self.acquire(kind).await?;
        let guard = LeaseGuard { locks: self.locks.clone(), lock_id: Some(lock.lock_id.clone()) };

        let result = self.execute(kind, &lock).await;
        guard.release().await;
        Ok(result)
    }

    async fn acquire(&self, kind: SyncKind) -> Result<SyncLock, SyncError> {
        let lease = self.lease_for(kind);
        let existing = match self.locks.acquire(kind, lease).await? {
            AcquireOutcome::Acquired(lock) => return Ok(lock),
            AcquireOutcome::Conflict(existing) => existing,
        };

        let age_ms = existing.age_ms(self.clock.now());
        let preemptible = kind == SyncKind::Manual
            && existing.kind == SyncKind::Auto
            && age_ms > self.opts.preempt_auto_after_ms as i64;
        if !preemptible {
            info!(%kind, held_by = %existing.lock_id, held_kind = %existing.kind, age_ms, "sync rejected, lock busy");
            return Err(SyncError::LockConflict { kind: existing.kind, age_ms, lock_id: existing.lock_id });
        }

        warn!(lock_id = %existing.lock_id, age_ms, "manual sync pre-empting long-running auto sync");
        self.locks.evict(&existing.lock_id).await?;
        match self.locks.acquire(kind, lease).await? {
            AcquireOutcome::Acquired(lock) => Ok(lock),
            AcquireOutcome::Conflict(winner) => Err(SyncError::LockConflict {
                kind: winner.kind,
                age_ms: winner.age_ms(self.clock.now()),
                lock_id: winner.lock_id,
            }),
        }
    }

    async fn execute(&self, kind: SyncKind, lock: &SyncLock) -> SyncResult {
        let started_at = self.clock.now();
        info!(%kind, lock_id = %lock.lock_id, "sync started");
        self.publish_status(SyncState::Running, kind, started_at, None, None);

        let outcome = self.engine.run().await;
        let finished_at = self.clock.now();

        let result = match outcome {
            Ok(report) => SyncResult {
                success: true,
                kind,
                lock_id: lock.lock_id.clone(),
                created: report.created,
                updated: report.updated,
                offline: report.offline,
                invalid: report.invalid,
                write_failures: report.write_failures,
                reason: None,
                started_at,
                finished_at,
            },
            Err(failure) => {
                error!(%kind, phase = %failure.phase, reason = %failure.reason, "sync failed");
                SyncResult {
                    success: false,
                    kind,
                    lock_id: lock.lock_id.clone(),
                    created: 0,
                    updated: 0,
                    offline: 0,
                    invalid: failure.invalid,
                    write_failures: 0,
                    reason: Some(failure.to_string()),
                    started_at,
                    finished_at,
                }
            }
        };

        *self.last_result.lock() = Some(result.clone());
        if result.success {
            *self.last_sync_time.lock() = Some(finished_at);
            self.publish_status(SyncState::Success, kind, finished_at, Some(&result), None);
            if result.created + result.updated > 0 {
                self.publish_device_update().await;
            }
        } else {
            self.publish_status(SyncState::Error, kind, finished_at, Some(&result), result.reason.clone());
        }
        result
    }

    fn publish_status(
        &self,
        status: SyncState,
        kind: SyncKind,
        at: DateTime<Utc>,
        result: Option<&SyncResult>,
        error: Option<String>,
    ) {
        let count = |f: fn(&SyncResult) -> usize| result.map(f).unwrap_or(0);
        self.events.publish(SyncEvent::SyncStatus(SyncStatusEvent {
            status,
            last_sync_time: at,
            created: count(|r| r.created),
            updated: count(|r| r.updated),
            offline: count(|r| r.offline),
            invalid: count(|r| r.invalid),
            sync_type: kind,
            error,
        }));
    }

    async fn publish_device_update(&self) {
        match self.engine.store().stats().await {
            Ok(stats) => self.events.publish(SyncEvent::DeviceUpdate(DeviceUpdateEvent {
                update_type: "sync_completed".into(),
                device: None,
                aggregate_stats: stats,
            })),
            Err(e) => warn!(error = %e, "cannot compute inventory stats"),
        }
    }

    /// Immediate run, then one attempt per `interval`. Overlapping ticks are
    /// absorbed by the single-flight guard. Replacing a running timer lets its
    /// current sync finish.
    pub fn start_auto_sync(self: &Arc<Self>, interval: Duration) {
        let interval = if interval < MIN_AUTO_INTERVAL {
            warn!(requested_ms = interval.as_millis() as u64, "auto sync interval too short, using minimum");
            MIN_AUTO_INTERVAL
        } else {
            interval
        };
        let (stop, mut stopped) = watch::channel(false);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }
                match this.run_protected(SyncKind::Auto).await {
                    Ok(result) if result.success => {
                        debug!(created = result.created, updated = result.updated, "auto sync finished")
                    }
                    Ok(_) => {}
                    Err(SyncError::InProgress) | Err(SyncError::LockConflict { .. }) => {
                        debug!("auto sync tick skipped")
                    }
                    Err(e) => error!(error = %e, "auto sync could not start"),
                }
            }
            debug!("auto sync timer ended");
        });

        let previous = self.auto.lock().replace(AutoSync { handle, interval, stop });
        if let Some(previous) = previous {
            drop(previous.stop());
        }
        info!(interval_secs = interval.as_secs(), "auto sync started");
    }

    /// Ends the timer. A sync it already started runs to completion.
    /// Returns false when auto sync was not running.
    pub fn stop_auto_sync(&self) -> bool {
        match self.auto.lock().take() {
            Some(auto) => {
                drop(auto.stop());
                info!("auto sync stopped");
                true
            }
            None => false,
        }
    }

    pub fn auto_sync_running(&self) -> bool {
        self.auto.lock().as_ref().is_some_and(|a| !a.handle.is_finished())
    }

    /// Removes the global lock whoever holds it.
    pub async fn force_unlock(&self) -> Result<Option<SyncLock>, LockError> {
        let removed = self.locks.force_release().await?;
        match &removed {
            Some(lock) => warn!(
                privileged = true,
                lock_id = %lock.lock_id,
                kind = %lock.kind,
                owner_pid = lock.owner_process_id,
                "sync lock force-released"
            ),
            None => warn!(privileged = true, "force unlock requested, no lock held"),
        }
        Ok(removed)
    }

    pub async fn sync_status(&self) -> Result<SyncStatusView, LockError> {
        let lock = self.locks.status().await?;
        let in_progress = self.in_flight.load(Ordering::Acquire);
        let auto_interval_secs = self.auto.lock().as_ref().map(|a| a.interval.as_secs());
        Ok(SyncStatusView {
            in_progress,
            phase: self.engine.phase(),
            can_sync: !in_progress && lock.is_none(),
            lock,
            last_sync_time: *self.last_sync_time.lock(),
            last_result: self.last_result(),
            auto_sync_running: self.auto_sync_running(),
            auto_interval_secs,
            lock_backend: self.locks.backend_name(),
        })
    }

    /// Stops the timer, waits for the sync it may be running, then releases
    /// any lock still held by this process.
    pub async fn shutdown(&self) {
        let auto = self.auto.lock().take();
        if let Some(auto) = auto {
            if let Err(e) = auto.stop().await {
                warn!(error = %e, "auto sync task ended abnormally");
            }
        }
        self.locks.shutdown().await;
    }
}
