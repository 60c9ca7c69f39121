use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{Bucket, ObjectStorageQueueConfig};
use crate::error::TaskError;
use crate::queue::message_format::MessageFormat;
use crate::queue::task::Task;
use crate::queue::Publisher;

/// Writes each task as one object. Retries are layered on top with
/// [`crate::publishers::RetryingPublisher`].
pub struct ObjectStoragePublisher {
    bucket: Arc<dyn Bucket>,
    prefix: String,
    format: MessageFormat,
    last_stamp: Mutex<i64>,
}

impl ObjectStoragePublisher {
    pub fn new(bucket: Arc<dyn Bucket>, config: &ObjectStorageQueueConfig) -> Self {
        Self {
            bucket,
            prefix: config.list_prefix(),
            format: MessageFormat::default(),
            last_stamp: Mutex::new(0),
        }
    }

    /// Strictly increasing, so republishing a task never reuses its key
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = match self.last_stamp.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = now.max(*last + 1);
        *last
    }

    fn object_key(&self, task: &Task) -> String {
        let stamp = self.next_stamp();
        let id = task
            .id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        format!("{}{}_{}", self.prefix, stamp, id)
    }
}

#[async_trait]
impl Publisher for ObjectStoragePublisher {
    async fn publish(&self, task: &Task) -> Result<(), TaskError> {
        let data = self.format.serialize(task)?;
        let key = self.object_key(task);
        self.bucket.write(&key, data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::objectstorage::{parse_key_timestamp, InMemoryBucket};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_publish_writes_prefixed_key() {
        let bucket = Arc::new(InMemoryBucket::new());
        let config = ObjectStorageQueueConfig {
            prefix: "envA/q".to_string(),
            ..Default::default()
        };
        let publisher = ObjectStoragePublisher::new(bucket.clone(), &config);

        let task = Task::new("process-hits", BTreeMap::new(), b"x".to_vec());
        publisher.publish(&task).await.unwrap();

        let keys = bucket.list("envA/q/", 10).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with(task.id().unwrap()));
        assert!(parse_key_timestamp(&keys[0]).is_some());
    }
}
