use async_trait::async_trait;
use std::sync::Arc;

use crate::error::TaskError;
use crate::metrics;
use crate::queue::task::Task;
use crate::queue::Publisher;

/// Counts tasks and body bytes per task type, then delegates
pub struct MonitoringPublisher {
    inner: Arc<dyn Publisher>,
}

impl MonitoringPublisher {
    pub fn new(inner: Arc<dyn Publisher>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Publisher for MonitoringPublisher {
    async fn publish(&self, task: &Task) -> Result<(), TaskError> {
        metrics::record_publish(&task.task_type, task.body.len());
        self.inner.publish(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publishers::testing::ScriptedPublisher;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_delegates_result() {
        let inner = Arc::new(ScriptedPublisher::failing(1));
        let publisher = MonitoringPublisher::new(inner.clone());
        let task = Task::new("process-hits", BTreeMap::new(), vec![1, 2, 3]);

        assert!(publisher.publish(&task).await.is_err());
        assert!(publisher.publish(&task).await.is_ok());
        assert_eq!(inner.published().len(), 1);
    }
}
