use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::error::TaskError;
use crate::queue::task::Task;
use crate::queue::Publisher;

/// Attempts a publish up to `retry_attempts + 1` times
pub struct RetryingPublisher {
    inner: Arc<dyn Publisher>,
    retry_attempts: u32,
}

impl RetryingPublisher {
    pub fn new(inner: Arc<dyn Publisher>, retry_attempts: u32) -> Self {
        Self {
            inner,
            retry_attempts,
        }
    }
}

#[async_trait]
impl Publisher for RetryingPublisher {
    async fn publish(&self, task: &Task) -> Result<(), TaskError> {
        let mut last_error = None;

        for attempt in 0..=self.retry_attempts {
            match self.inner.publish(task).await {
                Ok(()) => return Ok(()),
                // Retrying a malformed task cannot help
                Err(e) if e.is_droppable() => return Err(e),
                Err(e) => {
                    warn!(
                        task_type = %task.task_type,
                        attempt = attempt + 1,
                        "Publish attempt failed: {}",
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let attempts = self.retry_attempts + 1;
        Err(TaskError::retryable(format!(
            "failed to publish task after {} attempts: {}",
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}
