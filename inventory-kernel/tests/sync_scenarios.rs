use chrono::{Duration, Utc};
use inventory_devkit::fixtures::fleet;
use inventory_devkit::{ManualClock, MemoryLockBackend, StaticGeoResolver, TestHarness, UpstreamDeviceBuilder};
use inventory_kernel::engine::SyncPhase;
use inventory_kernel::lock::LockBackend;
use inventory_kernel::models::{AuditEvent, DeviceStatus, RiskLevel, SyncKind, SyncLock};
use inventory_kernel::mqtt::{DEVICE_UPDATE_TOPIC, SYNC_STATUS_TOPIC};
use inventory_kernel::orchestrator::SyncError;
use inventory_kernel::store::{DeviceStore, MemoryDeviceStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration as StdDuration;

const WAIT: StdDuration = StdDuration::from_secs(5);

fn planted(kind: SyncKind, acquired_ago: Duration, lease_ms: u64, now: chrono::DateTime<Utc>) -> SyncLock {
    SyncLock {
        lock_id: "sync_0_foreign01".into(),
        kind,
        acquired_at: now - acquired_ago,
        lease_duration_ms: lease_ms,
        owner_process_id: 4242,
    }
}

#[tokio::test]
async fn public_device_with_expired_key_is_critical_online_and_located() {
    let now = Utc::now();
    let device = UpstreamDeviceBuilder::new("edge-1", now)
        .addresses(&["100.64.3.4", "8.8.8.8"])
        .last_seen_ago(Duration::minutes(2))
        .key_expired_ago(Duration::days(1))
        .build();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .geo(Arc::new(StaticGeoResolver::with_public_dns()))
        .devices(vec![device])
        .build();

    let result = h.sync.manual_sync().await.unwrap();
    assert!(result.success);
    assert_eq!(result.created, 1);

    let record = h.store.get("edge-1").await.unwrap().unwrap();
    assert_eq!(record.status, DeviceStatus::Online);
    assert_eq!(record.risk_level, RiskLevel::Critical);
    let location = record.location.expect("located from 8.8.8.8");
    assert_eq!(location.country_code.as_deref(), Some("US"));
    assert_eq!(h.geo.lookups(), 1);

    let updates = h.recorder.wait_for(DEVICE_UPDATE_TOPIC, 1, WAIT).await.unwrap();
    assert_eq!(updates[0].payload["updateType"], "sync_completed");
    assert_eq!(updates[0].payload["aggregateStats"]["total"], 1);
}

#[tokio::test]
async fn concurrent_auto_syncs_across_instances_write_once() {
    let now = Utc::now();
    let clock = Arc::new(ManualClock::new(now));
    let backend: Arc<dyn LockBackend> = Arc::new(MemoryLockBackend::new());
    let store = Arc::new(MemoryDeviceStore::new());

    let first = TestHarness::builder()
        .clock(clock.clone())
        .lock_backend(backend.clone())
        .store(store.clone())
        .devices(fleet(4, now))
        .build();
    let second = TestHarness::builder()
        .clock(clock.clone())
        .lock_backend(backend.clone())
        .store(store.clone())
        .devices(fleet(4, now))
        .build();

    first.source.pause();
    let running = {
        let sync = first.sync.clone();
        tokio::spawn(async move { sync.run_protected(SyncKind::Auto).await })
    };
    first.source.wait_until_fetching().await;
    clock.advance(Duration::seconds(3));

    match second.sync.run_protected(SyncKind::Auto).await {
        Err(SyncError::LockConflict { kind, age_ms, .. }) => {
            assert_eq!(kind, SyncKind::Auto);
            assert!(age_ms > 0);
        }
        other => panic!("expected lock conflict, got {other:?}"),
    }
    assert_eq!(second.source.fetches(), 0);

    first.source.resume();
    let result = running.await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.created, 4);
    assert_eq!(store.list().await.unwrap().len(), 4);
    assert!(backend.load().await.unwrap().is_none());
    assert!(second.recorder.messages().is_empty());
}

#[tokio::test]
async fn second_trigger_in_same_process_is_absorbed() {
    let now = Utc::now();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(fleet(2, now))
        .build();

    h.source.pause();
    let running = {
        let sync = h.sync.clone();
        tokio::spawn(async move { sync.run_protected(SyncKind::Auto).await })
    };
    h.source.wait_until_fetching().await;

    assert!(matches!(h.sync.manual_sync().await, Err(SyncError::InProgress)));
    let status = h.sync.sync_status().await.unwrap();
    assert!(status.in_progress);
    assert!(!status.can_sync);

    h.source.resume();
    assert!(running.await.unwrap().unwrap().success);
    assert_eq!(h.source.fetches(), 1);
}

#[tokio::test]
async fn manual_sync_preempts_long_running_auto_sync() {
    let now = Utc::now();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(fleet(1, now))
        .build();
    h.lock_backend
        .put_if_absent(&planted(SyncKind::Auto, Duration::minutes(3), 600_000, now))
        .await
        .unwrap();

    let result = h.sync.manual_sync().await.unwrap();
    assert!(result.success);
    assert_ne!(result.lock_id, "sync_0_foreign01");
    assert!(h.lock_backend.load().await.unwrap().is_none());
}

#[tokio::test]
async fn manual_sync_does_not_preempt_young_auto_or_manual_locks() {
    let now = Utc::now();
    for lock in [
        planted(SyncKind::Auto, Duration::seconds(60), 600_000, now),
        planted(SyncKind::Manual, Duration::minutes(4), 300_000, now),
    ] {
        let h = TestHarness::builder()
            .clock(Arc::new(ManualClock::new(now)))
            .devices(fleet(1, now))
            .build();
        let held_kind = lock.kind;
        h.lock_backend.put_if_absent(&lock).await.unwrap();

        match h.sync.manual_sync().await {
            Err(SyncError::LockConflict { kind, .. }) => assert_eq!(kind, held_kind),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(h.source.fetches(), 0);
        assert_eq!(h.lock_backend.load().await.unwrap().unwrap().lock_id, "sync_0_foreign01");
    }
}

#[tokio::test]
async fn expired_lease_is_reclaimed_without_release() {
    let now = Utc::now();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(fleet(1, now))
        .build();
    h.lock_backend
        .put_if_absent(&planted(SyncKind::Auto, Duration::minutes(11), 600_000, now))
        .await
        .unwrap();

    let result = h.sync.run_protected(SyncKind::Auto).await.unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn absent_devices_go_offline_exactly_once() {
    let now = Utc::now();
    let clock = Arc::new(ManualClock::new(now));
    let stays = UpstreamDeviceBuilder::new("stays", now).build();
    let leaves = UpstreamDeviceBuilder::new("leaves", now).build();
    let long_gone = UpstreamDeviceBuilder::new("long-gone", now).last_seen_ago(Duration::hours(2)).build();
    let h = TestHarness::builder()
        .clock(clock.clone())
        .devices(vec![stays.clone(), leaves, long_gone])
        .build();

    let first = h.sync.run_protected(SyncKind::Auto).await.unwrap();
    assert_eq!(first.created, 3);
    assert_eq!(h.device_status("long-gone").await, Some(DeviceStatus::Offline));

    h.source.set_devices(vec![stays]);
    clock.advance(Duration::minutes(1));
    let second = h.sync.run_protected(SyncKind::Auto).await.unwrap();
    assert_eq!(second.offline, 1);
    assert_eq!(h.device_status("leaves").await, Some(DeviceStatus::Offline));
    let leaves = h.store.get("leaves").await.unwrap().unwrap();
    assert_eq!(leaves.updated_at, now + Duration::minutes(1));

    clock.advance(Duration::minutes(1));
    let third = h.sync.run_protected(SyncKind::Auto).await.unwrap();
    assert_eq!(third.offline, 0);
    assert_eq!(h.store.list().await.unwrap().len(), 3);
}

#[tokio::test]
async fn invalid_records_are_dropped_and_counted() {
    let now = Utc::now();
    let mut devices = fleet(2, now);
    devices.push(json!({ "id": "broken", "name": "broken" }));
    devices.push(UpstreamDeviceBuilder::new("bad-ip", now).addresses(&["not-an-ip"]).build());
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(devices)
        .build();

    let result = h.sync.manual_sync().await.unwrap();
    assert!(result.success);
    assert_eq!((result.created, result.invalid), (2, 2));
    assert!(h.store.get("broken").await.unwrap().is_none());

    h.recorder.wait_for(SYNC_STATUS_TOPIC, 2, WAIT).await.unwrap();
    let done = h.recorder.statuses("success");
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["invalid"], 2);
}

#[tokio::test]
async fn upstream_failure_reports_error_and_frees_lock() {
    let now = Utc::now();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(fleet(1, now))
        .build();
    h.source.fail_next(503);

    let result = h.sync.run_protected(SyncKind::Auto).await.unwrap();
    assert!(!result.success);
    assert!(result.reason.as_deref().unwrap_or_default().contains("503"));
    assert!(h.lock_backend.load().await.unwrap().is_none());

    h.recorder.wait_for(SYNC_STATUS_TOPIC, 2, WAIT).await.unwrap();
    let errors = h.recorder.statuses("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["syncType"], "auto");
    assert!(errors[0]["error"].as_str().is_some());
    assert!(h.recorder.find_by_topic(DEVICE_UPDATE_TOPIC).is_empty());

    // next attempt is unaffected
    assert!(h.sync.run_protected(SyncKind::Auto).await.unwrap().success);
}

#[tokio::test]
async fn audit_events_are_stored_once_and_failures_are_ignored() {
    let now = Utc::now();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(fleet(1, now))
        .build();
    let event = |minutes: i64, target: &str| AuditEvent {
        event_time: now - Duration::minutes(minutes),
        action: "UPDATE".into(),
        actor: Some("alice@example.com".into()),
        target: Some(target.into()),
        raw: json!({}),
        ingested_at: now,
    };
    h.source.set_audit_events(vec![event(10, "node-0"), event(5, "node-0"), event(3 * 24 * 60, "old")]);

    assert!(h.sync.manual_sync().await.unwrap().success);
    assert_eq!(h.store.audit_events().await.unwrap().len(), 2);
    assert!(h.sync.manual_sync().await.unwrap().success);
    assert_eq!(h.store.audit_events().await.unwrap().len(), 2);

    h.source.fail_audit(true);
    assert!(h.sync.manual_sync().await.unwrap().success);
}

#[tokio::test]
async fn force_unlock_frees_a_stuck_lock() {
    let now = Utc::now();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(fleet(1, now))
        .build();
    h.lock_backend
        .put_if_absent(&planted(SyncKind::Manual, Duration::seconds(30), 300_000, now))
        .await
        .unwrap();

    let removed = h.sync.force_unlock().await.unwrap().unwrap();
    assert_eq!(removed.lock_id, "sync_0_foreign01");
    assert!(h.sync.manual_sync().await.unwrap().success);
}

#[tokio::test]
async fn auto_sync_runs_immediately_and_stops() {
    let now = Utc::now();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(fleet(2, now))
        .build();

    h.sync.start_auto_sync(StdDuration::from_secs(3600));
    h.recorder.wait_for(DEVICE_UPDATE_TOPIC, 1, WAIT).await.unwrap();
    assert_eq!(h.source.fetches(), 1);
    assert!(h.sync.sync_status().await.unwrap().auto_sync_running);

    assert!(h.sync.stop_auto_sync());
    let status = h.sync.sync_status().await.unwrap();
    assert!(!status.auto_sync_running);
    assert_eq!(status.last_result.unwrap().kind, SyncKind::Auto);
}

async fn wait_until_idle(h: &TestHarness) {
    tokio::time::timeout(WAIT, async {
        while h.sync.sync_status().await.unwrap().in_progress {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn stopping_auto_sync_lets_the_running_sync_finish() {
    let now = Utc::now();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(fleet(2, now))
        .build();

    h.source.pause();
    h.sync.start_auto_sync(StdDuration::from_secs(3600));
    h.source.wait_until_fetching().await;
    assert!(h.sync.stop_auto_sync());
    h.source.resume();

    h.recorder.wait_for(SYNC_STATUS_TOPIC, 2, WAIT).await.unwrap();
    assert_eq!(h.recorder.statuses("running").len(), 1);
    assert_eq!(h.recorder.statuses("success").len(), 1);
    wait_until_idle(&h).await;

    let status = h.sync.sync_status().await.unwrap();
    assert_eq!(status.phase, SyncPhase::Done);
    assert!(status.last_result.unwrap().success);
    assert!(status.lock.is_none());
    assert!(!status.auto_sync_running);
    assert_eq!(h.store.list().await.unwrap().len(), 2);
    assert_eq!(h.source.fetches(), 1);
}

#[tokio::test]
async fn shutdown_waits_for_the_auto_sync_in_flight() {
    let now = Utc::now();
    let h = TestHarness::builder()
        .clock(Arc::new(ManualClock::new(now)))
        .devices(fleet(2, now))
        .build();

    h.source.pause();
    h.sync.start_auto_sync(StdDuration::from_secs(3600));
    h.source.wait_until_fetching().await;

    let shutdown = {
        let sync = h.sync.clone();
        tokio::spawn(async move { sync.shutdown().await })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(!shutdown.is_finished());

    h.source.resume();
    tokio::time::timeout(WAIT, shutdown).await.unwrap().unwrap();
    assert!(h.sync.last_result().unwrap().success);
    assert!(h.lock_backend.load().await.unwrap().is_none());
}

#[tokio::test]
async fn rejected_batch_keeps_its_invalid_count() {
    let h = TestHarness::builder()
        .devices(vec![json!({"id": "no-name"}), json!(42)])
        .build();

    let result = h.sync.manual_sync().await.unwrap();
    assert!(!result.success);
    assert_eq!(result.invalid, 2);

    h.recorder.wait_for(SYNC_STATUS_TOPIC, 2, WAIT).await.unwrap();
    let errors = h.recorder.statuses("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["invalid"], 2);
}
