use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::publishers::BackoffPingConfig;
use crate::queue::objectstorage::{ObjectStorageQueueConfig, RemoteBucketOptions};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub receiver: ReceiverConfig,
    pub sessions: SessionsConfig,
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Filesystem,
    Objectstorage,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub filesystem: FilesystemQueueConfig,
    pub objectstorage: ObjectStorageSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilesystemQueueConfig {
    pub directory: String,
}

impl Default for FilesystemQueueConfig {
    fn default() -> Self {
        Self {
            directory: "data/queue".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    #[default]
    Local,
    S3,
    Gcs,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObjectStorageSection {
    pub bucket_type: BucketType,
    /// Local bucket only
    pub bucket_directory: String,
    /// Remote bucket name
    pub bucket: String,
    /// S3-compatible endpoint, empty for AWS
    pub endpoint: String,
    pub region: String,
    /// Empty to use the environment's credentials
    pub access_key_id: String,
    pub secret_access_key: String,
    pub allow_http: bool,
    /// GCS only
    pub service_account_path: String,
    pub prefix: String,
    pub max_items_per_batch: usize,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub interval_exp_factor: f64,
    pub processing_timeout_secs: u64,
    pub retry_attempts: u32,
}

impl Default for ObjectStorageSection {
    fn default() -> Self {
        let queue = ObjectStorageQueueConfig::default();
        Self {
            bucket_type: BucketType::Local,
            bucket_directory: "data/bucket".to_string(),
            bucket: String::new(),
            endpoint: String::new(),
            region: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            allow_http: false,
            service_account_path: String::new(),
            prefix: queue.prefix,
            max_items_per_batch: queue.max_items_per_batch,
            min_interval_ms: queue.min_interval_ms,
            max_interval_ms: queue.max_interval_ms,
            interval_exp_factor: queue.interval_exp_factor,
            processing_timeout_secs: queue.processing_timeout_secs,
            retry_attempts: queue.retry_attempts,
        }
    }
}

impl ObjectStorageSection {
    pub fn remote_options(&self) -> RemoteBucketOptions {
        RemoteBucketOptions {
            bucket: self.bucket.clone(),
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            allow_http: self.allow_http,
            service_account_path: self.service_account_path.clone(),
        }
    }

    pub fn queue_config(&self) -> ObjectStorageQueueConfig {
        ObjectStorageQueueConfig {
            prefix: self.prefix.clone(),
            max_items_per_batch: self.max_items_per_batch,
            min_interval_ms: self.min_interval_ms,
            max_interval_ms: self.max_interval_ms,
            interval_exp_factor: self.interval_exp_factor,
            processing_timeout_secs: self.processing_timeout_secs,
            retry_attempts: self.retry_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PingMode {
    #[default]
    Periodic,
    Backoff,
    Disabled,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PingConfig {
    pub mode: PingMode,
    /// Periodic mode only
    pub interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub exp_factor: f64,
}

impl Default for PingConfig {
    fn default() -> Self {
        let backoff = BackoffPingConfig::default();
        Self {
            mode: PingMode::Periodic,
            interval_ms: 10_000,
            min_interval_ms: backoff.min_interval_ms,
            max_interval_ms: backoff.max_interval_ms,
            exp_factor: backoff.exp_factor,
        }
    }
}

impl PingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn backoff(&self) -> BackoffPingConfig {
        BackoffPingConfig {
            min_interval_ms: self.min_interval_ms,
            max_interval_ms: self.max_interval_ms,
            exp_factor: self.exp_factor,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub ping: PingConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_timeout_ms: 1_000,
            max_retries: 3,
            retry_delay_ms: 200,
            ping: PingConfig::default(),
        }
    }
}

impl ReceiverConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub timeout_secs: u64,
    pub join_by_session_stamp: bool,
    pub join_by_user_id: bool,
    pub bucket_width_ms: u64,
    pub conflict_strategy: ConflictStrategyKind,
}

/// How a hit joining an identifier owned by another client is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategyKind {
    /// Append the hit to the owner's proto-session
    #[default]
    Rewrite,
    /// Requeue the owner's whole proto-session with the hit
    Evict,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1_800,
            join_by_session_stamp: true,
            join_by_user_id: true,
            bucket_width_ms: 1_000,
            conflict_strategy: ConflictStrategyKind::Rewrite,
        }
    }
}

impl SessionsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn bucket_width(&self) -> Duration {
        Duration::from_millis(self.bucket_width_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./data/sessionizer.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub table: String,
    pub processing_timeout_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            table: "session_events".to_string(),
            processing_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub shutdown_drain_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shutdown_drain_secs: 5,
        }
    }
}

/// Load `path` (optional) layered with `SESSIONIZER__*` environment overrides
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(config::Environment::with_prefix("SESSIONIZER").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if !matches!(cfg.logging.format.as_str(), "text" | "json") {
        anyhow::bail!("logging.format must be 'text' or 'json', got '{}'", cfg.logging.format);
    }

    match cfg.queue.backend {
        QueueBackend::Filesystem => {
            if cfg.queue.filesystem.directory.is_empty() {
                anyhow::bail!("queue.filesystem.directory cannot be empty");
            }
        }
        QueueBackend::Objectstorage => {
            let section = &cfg.queue.objectstorage;
            match section.bucket_type {
                BucketType::Local => {
                    if section.bucket_directory.is_empty() {
                        anyhow::bail!("queue.objectstorage.bucket_directory cannot be empty");
                    }
                }
                BucketType::S3 | BucketType::Gcs => {
                    if section.bucket.is_empty() {
                        anyhow::bail!("queue.objectstorage.bucket is required for remote buckets");
                    }
                    if section.access_key_id.is_empty() != section.secret_access_key.is_empty() {
                        anyhow::bail!("queue.objectstorage.access_key_id and secret_access_key must be set together");
                    }
                }
            }
            cfg.queue
                .objectstorage
                .queue_config()
                .validate()
                .map_err(|e| anyhow::anyhow!("queue.objectstorage: {}", e))?;
        }
    }

    if cfg.receiver.batch_size == 0 {
        anyhow::bail!("receiver.batch_size must be positive");
    }

    let ping = &cfg.receiver.ping;
    match ping.mode {
        PingMode::Periodic if ping.interval_ms == 0 => {
            anyhow::bail!("receiver.ping.interval_ms must be positive");
        }
        PingMode::Backoff => {
            if ping.min_interval_ms > ping.max_interval_ms {
                anyhow::bail!(
                    "receiver.ping.min_interval_ms ({}) exceeds max_interval_ms ({})",
                    ping.min_interval_ms,
                    ping.max_interval_ms
                );
            }
            if ping.exp_factor < 1.0 {
                anyhow::bail!("receiver.ping.exp_factor must be at least 1.0");
            }
        }
        _ => {}
    }

    if cfg.sessions.timeout_secs == 0 {
        anyhow::bail!("sessions.timeout_secs must be positive");
    }
    if cfg.sessions.bucket_width_ms == 0 {
        anyhow::bail!("sessions.bucket_width_ms must be positive");
    }

    if cfg.storage.database_url.is_empty() {
        anyhow::bail!("storage.database_url cannot be empty");
    }
    if cfg.storage.max_connections == 0 {
        anyhow::bail!("storage.max_connections must be positive");
    }

    if cfg.warehouse.table.is_empty() {
        anyhow::bail!("warehouse.table cannot be empty");
    }

    Ok(())
}
