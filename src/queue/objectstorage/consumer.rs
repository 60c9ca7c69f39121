use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{parse_key_timestamp, Bucket, ObjectStorageQueueConfig, PollBackoff};
use crate::error::QueueError;
use crate::metrics;
use crate::queue::message_format::MessageFormat;
use crate::queue::task::Task;
use crate::queue::worker::TaskHandler;
use crate::queue::Consumer;
use crate::signals::ShutdownSignal;

const CONCURRENT_DOWNLOADS: usize = 8;

pub struct ObjectStorageConsumer {
    bucket: Arc<dyn Bucket>,
    config: ObjectStorageQueueConfig,
    format: MessageFormat,
}

impl ObjectStorageConsumer {
    pub fn new(bucket: Arc<dyn Bucket>, config: ObjectStorageQueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            bucket,
            config,
            format: MessageFormat::default(),
        })
    }

    /// Keys of the next batch, oldest first
    async fn next_batch(&self) -> Result<Vec<String>, QueueError> {
        let listed = self
            .bucket
            .list(&self.config.list_prefix(), self.config.max_items_per_batch * 2)
            .await?;

        let mut batch: Vec<(i64, String)> = listed
            .into_iter()
            .filter_map(|key| match parse_key_timestamp(&key) {
                Some(stamp) => Some((stamp, key)),
                None => {
                    warn!(key = %key, "Skipping object with unexpected key shape");
                    None
                }
            })
            .collect();

        batch.sort();
        batch.truncate(self.config.max_items_per_batch);
        Ok(batch.into_iter().map(|(_, key)| key).collect())
    }

    /// Download, handle and delete one batch. Any handler error aborts the
    /// whole batch before deletion.
    async fn process_batch(&self, keys: Vec<String>, handler: &dyn TaskHandler) -> Result<usize, QueueError> {
        let downloaded: Vec<(String, Vec<u8>)> = stream::iter(keys)
            .map(|key| async move {
                let data = self.bucket.read(&key).await?;
                Ok::<_, QueueError>((key, data))
            })
            .buffered(CONCURRENT_DOWNLOADS)
            .try_collect()
            .await?;

        let mut tasks: Vec<(String, Option<Task>)> = Vec::with_capacity(downloaded.len());
        for (key, data) in downloaded {
            match self.format.deserialize(&data) {
                Ok(task) => tasks.push((key, Some(task))),
                Err(e) => {
                    warn!(key = %key, "Dropping undecodable object: {}", e);
                    tasks.push((key, None));
                }
            }
        }

        for (key, task) in &tasks {
            let Some(task) = task else { continue };
            if let Err(e) = handler.handle(task).await {
                if e.is_droppable() {
                    warn!(key = %key, task_type = %task.task_type, "Dropping task: {}", e);
                    continue;
                }
                error!(key = %key, task_type = %task.task_type, "Handler failed, aborting batch: {}", e);
                return Err(QueueError::Handler(e));
            }
        }

        for (key, _) in &tasks {
            self.bucket.delete(key).await?;
        }

        Ok(tasks.len())
    }
}

#[async_trait]
impl Consumer for ObjectStorageConsumer {
    async fn consume_once(&self, handler: &dyn TaskHandler) -> Result<usize, QueueError> {
        let keys = self.next_batch().await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let timeout = self.config.processing_timeout();
        let count = keys.len();
        debug!(count, prefix = %self.config.prefix, "Processing object batch");

        tokio::time::timeout(timeout, self.process_batch(keys, handler))
            .await
            .map_err(|_| QueueError::Timeout(timeout))?
    }

    async fn consume(
        &self,
        handler: &dyn TaskHandler,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> Result<(), QueueError> {
        let mut backoff = PollBackoff::new(
            self.config.min_interval(),
            self.config.max_interval(),
            self.config.interval_exp_factor,
        );
        info!(prefix = %self.config.prefix, "Consuming tasks from object store");

        loop {
            let delay = match self.consume_once(handler).await {
                Ok(0) => backoff.on_empty(),
                Ok(processed) => {
                    debug!(processed, "Object batch done");
                    backoff.reset();
                    std::time::Duration::ZERO
                }
                Err(e) => {
                    error!(prefix = %self.config.prefix, "Object store pass failed: {}", e);
                    backoff.on_empty()
                }
            };
            metrics::record_poll_interval("objectstorage", backoff.current());

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Object store consumer shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::queue::objectstorage::{InMemoryBucket, ObjectStoragePublisher};
    use crate::queue::Publisher;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Collect {
        seen: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Collect {
        fn new(fail_on: Option<&str>) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail_on: fail_on.map(str::to_string),
            }
        }
    }

    #[async_trait]
    impl TaskHandler for Collect {
        async fn handle(&self, task: &Task) -> Result<(), TaskError> {
            self.seen.lock().unwrap().push(task.task_type.clone());
            if self.fail_on.as_deref() == Some(task.task_type.as_str()) {
                return Err(TaskError::retryable("warehouse down"));
            }
            Ok(())
        }
    }

    fn config(prefix: &str, max: usize) -> ObjectStorageQueueConfig {
        ObjectStorageQueueConfig {
            prefix: prefix.to_string(),
            max_items_per_batch: max,
            min_interval_ms: 1,
            max_interval_ms: 10,
            ..Default::default()
        }
    }

    async fn publish(publisher: &ObjectStoragePublisher, task_type: &str) {
        publisher
            .publish(&Task::new(task_type, BTreeMap::new(), vec![1]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn test_batch_is_truncated_and_ordered() {
        let bucket = Arc::new(InMemoryBucket::new());
        let cfg = config("q", 2);
        let publisher = ObjectStoragePublisher::new(bucket.clone(), &cfg);
        for name in ["a", "b", "c"] {
            publish(&publisher, name).await;
        }

        let consumer = ObjectStorageConsumer::new(bucket.clone(), cfg).unwrap();
        let handler = Collect::new(None);

        assert_eq!(consumer.consume_once(&handler).await.unwrap(), 2);
        assert_eq!(consumer.consume_once(&handler).await.unwrap(), 1);
        assert_eq!(consumer.consume_once(&handler).await.unwrap(), 0);
        assert_eq!(*handler.seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(bucket.len().await, 0);
    }

    #[tokio::test]
    async fn test_handler_error_aborts_whole_batch() {
        let bucket = Arc::new(InMemoryBucket::new());
        let cfg = config("q", 10);
        let publisher = ObjectStoragePublisher::new(bucket.clone(), &cfg);
        publish(&publisher, "a").await;
        publish(&publisher, "b").await;

        let consumer = ObjectStorageConsumer::new(bucket.clone(), cfg).unwrap();
        let handler = Collect::new(Some("b"));

        assert!(consumer.consume_once(&handler).await.is_err());
        // "a" succeeded but is kept for redelivery with the rest of the batch
        assert_eq!(bucket.len().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_keys_and_bodies() {
        let bucket = Arc::new(InMemoryBucket::new());
        bucket.write("q/not-a-task", vec![1, 2]).await.unwrap();
        bucket.write("q/5_garbage", vec![250]).await.unwrap();

        let consumer = ObjectStorageConsumer::new(bucket.clone(), config("q", 10)).unwrap();
        let handler = Collect::new(None);

        assert_eq!(consumer.consume_once(&handler).await.unwrap(), 1);
        assert!(handler.seen.lock().unwrap().is_empty());
        // Odd key is skipped, undecodable body is dropped
        assert_eq!(bucket.list("q/", 10).await.unwrap(), vec!["q/not-a-task".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let bucket = Arc::new(InMemoryBucket::new());
        let mut cfg = config("q", 10);
        cfg.max_items_per_batch = 0;
        assert!(ObjectStorageConsumer::new(bucket, cfg).is_err());
    }
}
