use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub upstream: UpstreamConf,
    pub lock: LockConf,
    pub sync: SyncConf,
    pub geo: GeoConf,
    pub store: StoreConf,
    pub mqtt: Option<MqttConf>,
    pub http: HttpConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConf {
    pub base_url: String,
    pub tailnet: String,
    #[serde(skip_serializing)] // jamais écrit sur disque
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    File,
    Redis,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LockConf {
    pub backend: LockBackendKind,
    pub file_path: PathBuf,
    pub redis_url: String,
    pub redis_key: String,
    pub auto_lease_ms: u64,
    pub manual_lease_ms: u64,
    /// Age above which a manual sync may pre-empt a live auto lock.
    pub preempt_auto_after_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConf {
    pub batch_size: usize,
    pub stale_grace_secs: i64,
    pub online_threshold_secs: i64,
    pub auto_interval_secs: u64,
    pub auto_start: bool,
    pub audit_days_back: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GeoProvider {
    Ipwho,
    None,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeoConf {
    pub provider: GeoProvider,
    pub endpoint: String,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
    /// Mesh-overlay ranges never sent to the resolver (CIDR notation).
    pub overlay_prefixes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for UpstreamConf {
    fn default() -> Self {
        Self {
            base_url: "https://api.tailscale.com/api/v2".into(),
            tailnet: "-".into(),
            api_key: None,
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl Default for LockConf {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::File,
            file_path: PathBuf::from("./data/.sync-lock"),
            redis_url: "redis://127.0.0.1:6379".into(),
            redis_key: "inventory:sync:lock".into(),
            auto_lease_ms: 10 * 60 * 1000,
            manual_lease_ms: 5 * 60 * 1000,
            preempt_auto_after_ms: 2 * 60 * 1000,
        }
    }
}

impl Default for SyncConf {
    fn default() -> Self {
        Self {
            batch_size: 50,
            stale_grace_secs: 30 * 60,
            online_threshold_secs: 5 * 60,
            auto_interval_secs: 5 * 60,
            auto_start: true,
            audit_days_back: 1,
        }
    }
}

impl Default for GeoConf {
    fn default() -> Self {
        Self {
            provider: GeoProvider::Ipwho,
            endpoint: "https://ipwho.is".into(),
            timeout_secs: 5,
            cache_ttl_secs: 3600,
            overlay_prefixes: vec!["100.64.0.0/10".into(), "fd7a:115c:a1e0::/48".into()],
        }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { path: PathBuf::from("./data/devices.json") }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl KernelConfig {
    /// Parse YAML; an empty document yields the defaults.
    pub fn from_yaml(txt: &str, path: &Path) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt).map_err(|source| ConfigError::Yaml { path: path.to_path_buf(), source })
    }

    /// Environment overrides for secrets and per-deployment values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("UPSTREAM_API_KEY").filter(|v| !v.is_empty()) {
            self.upstream.api_key = Some(key);
        }
        if let Some(tailnet) = lookup("UPSTREAM_TAILNET").filter(|v| !v.is_empty()) {
            self.upstream.tailnet = tailnet;
        }
        if let Some(backend) = lookup("INVENTORY_LOCK_BACKEND") {
            self.lock.backend = match backend.to_ascii_lowercase().as_str() {
                "file" => LockBackendKind::File,
                "redis" => LockBackendKind::Redis,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "INVENTORY_LOCK_BACKEND".into(),
                        value: backend,
                    })
                }
            };
        }
        if let Some(url) = lookup("INVENTORY_REDIS_URL").filter(|v| !v.is_empty()) {
            self.lock.redis_url = url;
        }
        Ok(())
    }
}

pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = PathBuf::from(std::env::var("INVENTORY_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into()));
    let mut cfg = if path.exists() {
        let txt = fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        KernelConfig::from_yaml(&txt, &path)?
    } else {
        warn!(path = %path.display(), "no config file, using defaults");
        KernelConfig::default()
    };
    cfg.apply_env(|key| std::env::var(key).ok())?;
    Ok(cfg)
}
