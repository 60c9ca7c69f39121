use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::Storage;
use crate::encoding::Codec;
use crate::error::TaskError;
use crate::hits::{hits_task, Hit};
use crate::queue::Publisher;

/// Serializes a hit batch into one `process-hits` task and publishes it
pub struct PublishingStorage {
    publisher: Arc<dyn Publisher>,
    codec: Codec,
}

impl PublishingStorage {
    pub fn new(publisher: Arc<dyn Publisher>, codec: Codec) -> Self {
        Self { publisher, codec }
    }
}

#[async_trait]
impl Storage for PublishingStorage {
    async fn push(&self, hits: Vec<Hit>) -> Result<(), TaskError> {
        if hits.is_empty() {
            return Ok(());
        }
        let count = hits.len();
        let task = hits_task(self.codec, hits)?;
        self.publisher.publish(&task).await?;
        debug!(count, bytes = task.body.len(), "Published hit batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hits::{HitProcessingTask, HIT_PROCESSING_TASK_NAME};
    use crate::publishers::testing::ScriptedPublisher;
    use chrono::Utc;

    #[tokio::test]
    async fn test_push_publishes_one_task() {
        let publisher = Arc::new(ScriptedPublisher::default());
        let storage = PublishingStorage::new(publisher.clone(), Codec::GzipJson);

        let hits = vec![Hit::new("h1", "c1", Utc::now()), Hit::new("h2", "c1", Utc::now())];
        storage.push(hits.clone()).await.unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].task_type, HIT_PROCESSING_TASK_NAME);
        let body: HitProcessingTask = Codec::GzipJson.decode(&published[0].body).unwrap();
        assert_eq!(body.hits, hits);
    }

    #[tokio::test]
    async fn test_empty_push_is_a_noop() {
        let publisher = Arc::new(ScriptedPublisher::default());
        let storage = PublishingStorage::new(publisher.clone(), Codec::Json);
        storage.push(Vec::new()).await.unwrap();
        assert_eq!(publisher.attempts(), 0);
    }
}
