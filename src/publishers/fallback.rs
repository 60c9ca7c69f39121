use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::TaskError;
use crate::queue::task::Task;
use crate::queue::Publisher;

/// Publishes to a primary, retrying with a fixed delay, then hands the
/// task to a fallback sink (usually [`super::StdoutPublisher`]).
pub struct FallbackPublisher {
    primary: Arc<dyn Publisher>,
    fallback: Arc<dyn Publisher>,
    max_retries: u32,
    retry_delay: Duration,
}

impl FallbackPublisher {
    pub fn new(
        primary: Arc<dyn Publisher>,
        fallback: Arc<dyn Publisher>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            max_retries,
            retry_delay,
        }
    }
}

#[async_trait]
impl Publisher for FallbackPublisher {
    async fn publish(&self, task: &Task) -> Result<(), TaskError> {
        let mut primary_error = None;

        for attempt in 0..=self.max_retries {
            match self.primary.publish(task).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        task_type = %task.task_type,
                        attempt = attempt + 1,
                        "Primary publish failed: {}",
                        e
                    );
                    primary_error = Some(e);
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        let primary_error = primary_error.map(|e| e.to_string()).unwrap_or_default();
        warn!(task_type = %task.task_type, "Publishing to fallback storage");

        self.fallback.publish(task).await.map_err(|fallback_error| {
            error!(
                task_type = %task.task_type,
                "Fallback publish failed, task is lost: {}",
                fallback_error
            );
            TaskError::retryable(format!(
                "both primary (after {} retries) and fallback storage failed: primary: {}, fallback: {}",
                self.max_retries, primary_error, fallback_error
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publishers::testing::ScriptedPublisher;
    use std::collections::BTreeMap;

    fn task() -> Task {
        Task::new("process-hits", BTreeMap::new(), b"hits".to_vec())
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let primary = Arc::new(ScriptedPublisher::failing(2));
        let fallback = Arc::new(ScriptedPublisher::default());
        let publisher =
            FallbackPublisher::new(primary.clone(), fallback.clone(), 3, Duration::from_millis(1));

        publisher.publish(&task()).await.unwrap();
        assert_eq!(primary.attempts(), 3);
        assert_eq!(fallback.attempts(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_primary_uses_fallback() {
        let primary = Arc::new(ScriptedPublisher::failing(usize::MAX));
        let fallback = Arc::new(ScriptedPublisher::default());
        let publisher =
            FallbackPublisher::new(primary.clone(), fallback.clone(), 2, Duration::from_millis(1));

        let task = task();
        publisher.publish(&task).await.unwrap();
        assert_eq!(primary.attempts(), 3);
        assert_eq!(fallback.published(), vec![task]);
    }

    #[tokio::test]
    async fn test_both_failing_reports_both() {
        let primary = Arc::new(ScriptedPublisher::failing(usize::MAX));
        let fallback = Arc::new(ScriptedPublisher::failing(usize::MAX));
        let publisher = FallbackPublisher::new(primary, fallback, 1, Duration::from_millis(1));

        let err = publisher.publish(&task()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "both primary (after 1 retries) and fallback storage failed: \
             primary: attempt 2 failed, fallback: attempt 1 failed"
        );
    }
}
