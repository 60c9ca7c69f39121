//! Process wiring for the `server`, `receiver` and `worker` modes

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{
    BucketType, Config, ConflictStrategyKind, ObjectStorageSection, PingMode, QueueBackend, QueueConfig,
};
use crate::encoding::Codec;
use crate::hits::{identifier_types, HIT_PROCESSING_TASK_NAME};
use crate::metrics;
use crate::protosessions::{
    ConflictStrategy, DeduplicatingBackend, EvictWholeProtoSession, HitsTaskHandler, Orchestrator, OrchestratorConfig,
    RewriteIdAndUpdateInPlace, SqliteBatchedIoBackend, TimingWheel,
};
use crate::publishers::{
    BackoffPingingPublisher, FallbackPublisher, MonitoringPublisher, PingingPublisher, RetryingPublisher,
    StdoutPublisher,
};
use crate::queue::filesystem::FilesystemQueue;
use crate::queue::objectstorage::{
    Bucket, LocalDirBucket, ObjectStorageConsumer, ObjectStoragePublisher, ObjectStoreBucket,
};
use crate::queue::worker::{MetricsMiddleware, Worker};
use crate::queue::{Consumer, Publisher};
use crate::receiver::{BatchingStorage, PublishingStorage, Storage};
use crate::server;
use crate::signals::{setup_signal_handlers, shutdown_channel, ShutdownSignal};
use crate::storage::{database, SqliteKv};
use crate::warehouse::{clickhouse_mapper, LoggingDriver, WarehouseCloser};

/// Codec for hit batch bodies on the queue
pub const HITS_CODEC: Codec = Codec::GzipJson;

/// Timing wheel namespace in the KV store
pub const SESSIONS_WHEEL: &str = "sessions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Receiver and worker in one process
    Server,
    Receiver,
    Worker,
}

impl Mode {
    pub fn runs_receiver(self) -> bool {
        matches!(self, Mode::Server | Mode::Receiver)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, Mode::Server | Mode::Worker)
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Server => "server",
            Mode::Receiver => "receiver",
            Mode::Worker => "worker",
        }
    }
}

/// Both ends of the configured queue backend
pub struct QueueEndpoints {
    pub publisher: Arc<dyn Publisher>,
    pub consumer: Arc<dyn Consumer>,
}

pub async fn open_queue(config: &QueueConfig) -> Result<QueueEndpoints> {
    match config.backend {
        QueueBackend::Filesystem => {
            let queue = Arc::new(
                FilesystemQueue::new(&config.filesystem.directory)
                    .await
                    .context("Failed to open filesystem queue")?,
            );
            Ok(QueueEndpoints {
                publisher: queue.clone(),
                consumer: queue,
            })
        }
        QueueBackend::Objectstorage => {
            let section = &config.objectstorage;
            let queue_config = section.queue_config();
            let bucket = open_bucket(section).await?;

            let publisher = RetryingPublisher::new(
                Arc::new(ObjectStoragePublisher::new(bucket.clone(), &queue_config)),
                queue_config.retry_attempts,
            );
            let consumer = ObjectStorageConsumer::new(bucket, queue_config)?;
            Ok(QueueEndpoints {
                publisher: Arc::new(publisher),
                consumer: Arc::new(consumer),
            })
        }
    }
}

async fn open_bucket(section: &ObjectStorageSection) -> Result<Arc<dyn Bucket>> {
    let bucket: Arc<dyn Bucket> = match section.bucket_type {
        BucketType::Local => Arc::new(
            LocalDirBucket::new(&section.bucket_directory)
                .await
                .context("Failed to open bucket directory")?,
        ),
        BucketType::S3 => Arc::new(
            ObjectStoreBucket::s3(&section.remote_options()).context("Failed to configure S3 bucket")?,
        ),
        BucketType::Gcs => Arc::new(
            ObjectStoreBucket::gcs(&section.remote_options()).context("Failed to configure GCS bucket")?,
        ),
    };
    info!(bucket_type = ?section.bucket_type, prefix = %section.prefix, "Object storage queue bucket ready");
    Ok(bucket)
}

/// Monitoring and stdout fallback around the queue publisher
pub fn publisher_stack(queue: Arc<dyn Publisher>, cfg: &Config) -> Arc<dyn Publisher> {
    let monitored: Arc<dyn Publisher> = Arc::new(MonitoringPublisher::new(queue));
    Arc::new(FallbackPublisher::new(
        monitored,
        Arc::new(StdoutPublisher::new()),
        cfg.receiver.max_retries,
        cfg.receiver.retry_delay(),
    ))
}

/// Wrap `publisher` in the configured ping scheduler and start its loop
pub fn start_pinger(
    publisher: Arc<dyn Publisher>,
    cfg: &Config,
    shutdown: &broadcast::Sender<ShutdownSignal>,
) -> (Arc<dyn Publisher>, Option<JoinHandle<()>>) {
    let ping = &cfg.receiver.ping;
    match ping.mode {
        PingMode::Periodic => {
            let pinger = Arc::new(PingingPublisher::new(publisher, ping.interval()));
            let handle = pinger.clone().spawn(shutdown.subscribe());
            (pinger, Some(handle))
        }
        PingMode::Backoff => {
            let pinger = Arc::new(BackoffPingingPublisher::new(publisher, ping.backoff()));
            let handle = pinger.clone().spawn(shutdown.subscribe());
            (pinger, Some(handle))
        }
        PingMode::Disabled => (publisher, None),
    }
}

fn ensure_database_dir(database_url: &str) -> Result<()> {
    let path = database_url.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
    if path.contains(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

/// Open the session database, creating its directory and running migrations
pub async fn open_database(cfg: &Config) -> Result<sqlx::SqlitePool> {
    ensure_database_dir(&cfg.storage.database_url)?;
    database::connect(&cfg.storage.database_url, cfg.storage.max_connections).await
}

/// Assemble the session orchestrator over the sqlite backend
pub async fn build_orchestrator(
    cfg: &Config,
    pool: sqlx::SqlitePool,
    requeue: Arc<dyn Storage>,
    shutdown: broadcast::Receiver<ShutdownSignal>,
) -> Result<Arc<Orchestrator>> {
    let backend = SqliteBatchedIoBackend::new(pool.clone())
        .await
        .context("Failed to load proto-session state")?;
    let wheel = TimingWheel::new(Arc::new(SqliteKv::new(pool)), SESSIONS_WHEEL, cfg.sessions.bucket_width());
    let closer = WarehouseCloser::new(
        Arc::new(LoggingDriver),
        cfg.warehouse.table.clone(),
        &clickhouse_mapper(),
        Duration::from_secs(cfg.warehouse.processing_timeout_secs),
    )
    .context("Session schema cannot be mapped")?;

    let orchestrator = Orchestrator::new(
        Arc::new(DeduplicatingBackend::new(Arc::new(backend))),
        wheel,
        Arc::new(closer),
        OrchestratorConfig {
            session_timeout: cfg.sessions.timeout(),
            identifier_types: identifier_types(cfg.sessions.join_by_session_stamp, cfg.sessions.join_by_user_id),
        },
    )
    .with_strategy(conflict_strategy(cfg.sessions.conflict_strategy))
    .with_requeue(requeue)
    .with_shutdown(shutdown);

    Ok(Arc::new(orchestrator))
}

fn conflict_strategy(kind: ConflictStrategyKind) -> Arc<dyn ConflictStrategy> {
    match kind {
        ConflictStrategyKind::Rewrite => Arc::new(RewriteIdAndUpdateInPlace),
        ConflictStrategyKind::Evict => Arc::new(EvictWholeProtoSession),
    }
}

fn metrics_handle(cfg: &Config) -> Result<Arc<PrometheusHandle>> {
    if cfg.metrics.enabled {
        info!("Initializing Prometheus metrics...");
        Ok(Arc::new(metrics::init_metrics()?))
    } else {
        // Renders nothing; no recorder is installed
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        Ok(Arc::new(recorder.handle()))
    }
}

/// Run the process in `mode` until SIGINT/SIGTERM
///
/// This function:
/// 1. Initializes metrics and signal handlers
/// 2. Opens the queue and the publisher stack
/// 3. Starts the receiver buffer and ping scheduler (receiver modes)
/// 4. Starts the session worker (worker modes)
/// 5. Serves HTTP until shutdown, then stops every loop
pub async fn run(cfg: Config, mode: Mode) -> Result<()> {
    let metrics_handle = metrics_handle(&cfg)?;

    let shutdown_tx = shutdown_channel();
    let signal_handle = setup_signal_handlers(shutdown_tx.clone());

    if cfg.queue.backend == QueueBackend::Filesystem && mode != Mode::Server {
        warn!(
            mode = mode.name(),
            "Filesystem queue with separate receiver and worker processes only works when both share {}",
            cfg.queue.filesystem.directory
        );
    }

    let queue = open_queue(&cfg.queue).await?;
    let publisher = publisher_stack(queue.publisher.clone(), &cfg);
    let (publisher, ping_handle) = if mode.runs_receiver() {
        start_pinger(publisher, &cfg, &shutdown_tx)
    } else {
        (publisher, None)
    };
    let publishing: Arc<dyn Storage> = Arc::new(PublishingStorage::new(publisher, HITS_CODEC));

    let mut batching = None;
    let mut flush_handle = None;
    if mode.runs_receiver() {
        let storage = Arc::new(BatchingStorage::new(
            publishing.clone(),
            cfg.receiver.batch_size,
            cfg.receiver.batch_timeout(),
        ));
        flush_handle = Some(storage.clone().spawn_flush_loop(shutdown_tx.subscribe()));
        batching = Some(storage);
    }

    let mut orchestrator = None;
    let mut consumer_handle = None;
    if mode.runs_worker() {
        let pool = open_database(&cfg).await?;
        let orch = build_orchestrator(&cfg, pool, publishing.clone(), shutdown_tx.subscribe()).await?;
        let worker = Arc::new(
            Worker::new()
                .with_middleware(Arc::new(MetricsMiddleware))
                .with_handler(HIT_PROCESSING_TASK_NAME, Arc::new(HitsTaskHandler::new(orch.clone(), HITS_CODEC))),
        );

        let consumer = queue.consumer.clone();
        let rx = shutdown_tx.subscribe();
        consumer_handle = Some(tokio::spawn(async move { consumer.consume(worker.as_ref(), rx).await }));
        orchestrator = Some(orch);
    }

    info!(mode = mode.name(), queue = ?cfg.queue.backend, "Sessionizer started");

    let ingest = batching.clone().map(|b| b as Arc<dyn Storage>);
    let router = server::create_router(metrics_handle, ingest);
    server::serve(
        &cfg.server,
        router,
        &shutdown_tx,
        Duration::from_secs(cfg.metrics.shutdown_drain_secs),
    )
    .await?;

    // A listener failure also stops the loops
    let _ = shutdown_tx.send(ShutdownSignal::Graceful);

    if let Some(handle) = consumer_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Queue consumer stopped with error: {}", e),
            Err(e) => error!("Queue consumer task failed: {}", e),
        }
    }
    if let Some(handle) = flush_handle {
        let _ = handle.await;
    }
    if let Some(storage) = batching {
        if let Err(e) = storage.close().await {
            error!("Failed to flush buffered hits: {}", e);
        }
    }
    if let Some(handle) = ping_handle {
        let _ = handle.await;
    }
    if let Some(orch) = orchestrator {
        if let Err(e) = orch.stop().await {
            error!("Failed to stop session backend: {}", e);
        }
    }

    signal_handle.abort();
    info!("Sessionizer stopped gracefully");
    Ok(())
}
