/*!
# Inventory DevKit - Doublures de test pour le synchroniseur

Test support for the inventory kernel:
- fake upstream source (scripted devices, failures, blocking gate)
- manual clock, static geolocation, in-memory lock backend
- event recorder resolving bus events to their MQTT topics
- a harness wiring a full orchestrator out of those fakes
*/

pub mod clock;
pub mod fixtures;
pub mod geo;
pub mod harness;
pub mod lock;
pub mod recorder;
pub mod source;

pub use clock::ManualClock;
pub use fixtures::UpstreamDeviceBuilder;
pub use geo::StaticGeoResolver;
pub use harness::TestHarness;
pub use lock::MemoryLockBackend;
pub use recorder::{EventRecorder, RecordedMessage};
pub use source::FakeDeviceSource;

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
