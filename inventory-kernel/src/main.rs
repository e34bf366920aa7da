/**
 * INVENTORY KERNEL - Point d'entrée du synchroniseur d'inventaire
 *
 * RÔLE : Wiring of config, lock backend, store, upstream client, enricher,
 * orchestrator, MQTT forwarder and HTTP API. Releases held locks on SIGINT/SIGTERM.
 */

use anyhow::Context;
use inventory_kernel::config::{load_config, GeoProvider, KernelConfig, LockBackendKind};
use inventory_kernel::engine::{AtomicSyncEngine, EngineOptions};
use inventory_kernel::enrich::StateEnricher;
use inventory_kernel::events::EventBus;
use inventory_kernel::geo::{GeoResolver, IpWhoResolver, NullGeoResolver};
use inventory_kernel::http::{build_router, AppState};
use inventory_kernel::lock::{FileLockBackend, LockManager, RedisLockBackend, SharedLockBackend};
use inventory_kernel::mqtt::spawn_mqtt_forwarder;
use inventory_kernel::orchestrator::{OrchestratorOptions, SyncOrchestrator};
use inventory_kernel::state::system_clock;
use inventory_kernel::store::{JsonDeviceStore, SharedDeviceStore};
use inventory_kernel::upstream::UpstreamClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("shutdown requested (SIGINT)"),
        _ = terminate => info!("shutdown requested (SIGTERM)"),
    }
}

async fn build_lock_backend(cfg: &KernelConfig) -> anyhow::Result<SharedLockBackend> {
    Ok(match cfg.lock.backend {
        LockBackendKind::File => Arc::new(FileLockBackend::new(&cfg.lock.file_path)),
        LockBackendKind::Redis => Arc::new(
            RedisLockBackend::connect(&cfg.lock.redis_url, cfg.lock.redis_key.clone())
                .await
                .context("connecting to redis lock backend")?,
        ),
    })
}

fn build_geo_resolver(cfg: &KernelConfig) -> anyhow::Result<Arc<dyn GeoResolver>> {
    Ok(match cfg.geo.provider {
        GeoProvider::Ipwho => Arc::new(IpWhoResolver::new(
            cfg.geo.endpoint.clone(),
            Duration::from_secs(cfg.geo.timeout_secs),
            Duration::from_secs(cfg.geo.cache_ttl_secs),
        )?),
        GeoProvider::None => Arc::new(NullGeoResolver),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await.context("loading configuration")?;
    if cfg.upstream.api_key.is_none() {
        warn!("UPSTREAM_API_KEY not set, every sync will fail until it is configured");
    }
    let clock = system_clock();

    let lock_backend = build_lock_backend(&cfg).await?;
    let locks = Arc::new(LockManager::new(lock_backend, clock.clone()));
    info!(backend = locks.backend_name(), "sync lock backend ready");

    let store: SharedDeviceStore = Arc::new(
        JsonDeviceStore::open(&cfg.store.path)
            .await
            .with_context(|| format!("opening inventory at {}", cfg.store.path.display()))?,
    );

    let enricher = StateEnricher::new(
        build_geo_resolver(&cfg)?,
        &cfg.geo.overlay_prefixes,
        chrono::Duration::seconds(cfg.sync.online_threshold_secs),
    )?;
    let source = UpstreamClient::new(&cfg.upstream)?;

    let engine = AtomicSyncEngine::new(
        Arc::new(source),
        Arc::new(enricher),
        store.clone(),
        clock.clone(),
        EngineOptions {
            batch_size: cfg.sync.batch_size,
            stale_grace: chrono::Duration::seconds(cfg.sync.stale_grace_secs),
            audit_lookback: (cfg.sync.audit_days_back > 0).then(|| chrono::Duration::days(cfg.sync.audit_days_back)),
        },
    );

    let events = EventBus::new();
    if let Some(mqtt) = cfg.mqtt.clone() {
        info!(host = %mqtt.host, port = mqtt.port, "forwarding sync events to MQTT");
        spawn_mqtt_forwarder(mqtt, events.clone());
    }

    let sync = SyncOrchestrator::new(
        engine,
        locks,
        events,
        clock,
        OrchestratorOptions {
            auto_lease_ms: cfg.lock.auto_lease_ms,
            manual_lease_ms: cfg.lock.manual_lease_ms,
            preempt_auto_after_ms: cfg.lock.preempt_auto_after_ms,
        },
    );

    let auto_interval = Duration::from_secs(cfg.sync.auto_interval_secs.max(1));
    if cfg.sync.auto_start {
        sync.start_auto_sync(auto_interval);
    }

    let api_key = std::env::var("INVENTORY_API_KEY").ok().filter(|k| !k.is_empty());
    if api_key.is_none() {
        warn!("INVENTORY_API_KEY not set, only /health will answer");
    }
    let app = build_router(AppState {
        sync: sync.clone(),
        store,
        api_key: api_key.map(Arc::from),
        default_auto_interval: auto_interval,
    });

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sync.shutdown().await;
    info!("inventory kernel stopped");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sigterm_resolves_shutdown_signal() {
        let waiter = tokio::spawn(shutdown_signal());
        // let the task install its handlers before signalling
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    }
}
