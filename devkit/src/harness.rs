/*!
Test Harness pour le synchroniseur

Wires a real `SyncOrchestrator` (engine, enricher, lock manager, store)
over fakes: scripted upstream, manual clock, static geolocation and an
in-memory lock backend that several harnesses can share to play separate
instances.
*/

use crate::{EventRecorder, FakeDeviceSource, ManualClock, MemoryLockBackend, StaticGeoResolver};
use inventory_kernel::engine::{AtomicSyncEngine, EngineOptions};
use inventory_kernel::enrich::StateEnricher;
use inventory_kernel::events::EventBus;
use inventory_kernel::lock::{LockBackend, LockManager};
use inventory_kernel::orchestrator::{OrchestratorOptions, SyncOrchestrator};
use inventory_kernel::state::SharedClock;
use inventory_kernel::store::{DeviceStore, MemoryDeviceStore};
use serde_json::Value;
use std::sync::Arc;

pub const OVERLAY_PREFIXES: [&str; 2] = ["100.64.0.0/10", "fd7a:115c:a1e0::/48"];

pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub source: Arc<FakeDeviceSource>,
    pub geo: Arc<StaticGeoResolver>,
    pub store: Arc<MemoryDeviceStore>,
    pub lock_backend: Arc<dyn LockBackend>,
    pub locks: Arc<LockManager>,
    pub recorder: EventRecorder,
    pub sync: Arc<SyncOrchestrator>,
}

pub struct TestHarnessBuilder {
    devices: Vec<Value>,
    clock: Option<Arc<ManualClock>>,
    lock_backend: Option<Arc<dyn LockBackend>>,
    store: Option<Arc<MemoryDeviceStore>>,
    geo: Option<Arc<StaticGeoResolver>>,
    engine: EngineOptions,
    orchestrator: OrchestratorOptions,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder {
            devices: Vec::new(),
            clock: None,
            lock_backend: None,
            store: None,
            geo: None,
            engine: EngineOptions::default(),
            orchestrator: OrchestratorOptions::default(),
        }
    }

    /// Harness with an empty upstream. Must run inside a tokio runtime.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn device_status(&self, device_id: &str) -> Option<inventory_kernel::models::DeviceStatus> {
        self.store.get(device_id).await.ok().flatten().map(|d| d.status)
    }
}

impl TestHarnessBuilder {
    pub fn devices(mut self, devices: Vec<Value>) -> Self {
        self.devices = devices;
        self
    }

    pub fn clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shares lock storage with another harness (another "instance").
    pub fn lock_backend(mut self, backend: Arc<dyn LockBackend>) -> Self {
        self.lock_backend = Some(backend);
        self
    }

    pub fn store(mut self, store: Arc<MemoryDeviceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn geo(mut self, geo: Arc<StaticGeoResolver>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn engine_options(mut self, opts: EngineOptions) -> Self {
        self.engine = opts;
        self
    }

    pub fn orchestrator_options(mut self, opts: OrchestratorOptions) -> Self {
        self.orchestrator = opts;
        self
    }

    pub fn build(self) -> TestHarness {
        crate::init_test_logging();

        let clock = self.clock.unwrap_or_else(|| Arc::new(ManualClock::starting_now()));
        let shared_clock: SharedClock = clock.clone();
        let source = Arc::new(FakeDeviceSource::new(self.devices));
        let geo = self.geo.unwrap_or_else(|| Arc::new(StaticGeoResolver::new()));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryDeviceStore::new()));
        let lock_backend = self.lock_backend.unwrap_or_else(|| Arc::new(MemoryLockBackend::new()));

        let overlay: Vec<String> = OVERLAY_PREFIXES.iter().map(|p| p.to_string()).collect();
        let enricher = StateEnricher::new(geo.clone(), &overlay, chrono::Duration::minutes(5))
            .expect("static overlay prefixes");
        let engine = AtomicSyncEngine::new(
            source.clone(),
            Arc::new(enricher),
            store.clone(),
            shared_clock.clone(),
            self.engine,
        );
        let locks = Arc::new(LockManager::new(lock_backend.clone(), shared_clock.clone()));
        let events = EventBus::new();
        let recorder = EventRecorder::attach(&events);
        let sync = SyncOrchestrator::new(engine, locks.clone(), events, shared_clock, self.orchestrator);

        TestHarness { clock, source, geo, store, lock_backend, locks, recorder, sync }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::fleet;

    #[tokio::test]
    async fn test_harness_runs_a_sync() {
        let now = chrono::Utc::now();
        let h = TestHarness::builder()
            .clock(Arc::new(ManualClock::new(now)))
            .devices(fleet(3, now))
            .build();
        let result = h.sync.manual_sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.created, 3);
        assert_eq!(h.source.fetches(), 1);
    }
}
