//! Publisher decorators layered over a queue backend

pub mod backoff_pinging;
pub mod fallback;
pub mod monitoring;
pub mod pinging;
pub mod retrying;
pub mod stdout;

pub use backoff_pinging::{BackoffPingConfig, BackoffPingingPublisher};
pub use fallback::FallbackPublisher;
pub use monitoring::MonitoringPublisher;
pub use pinging::PingingPublisher;
pub use retrying::RetryingPublisher;
pub use stdout::StdoutPublisher;

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::error::TaskError;
    use crate::queue::task::Task;
    use crate::queue::Publisher;

    /// Fails the first `failures` publishes, then records tasks
    #[derive(Default)]
    pub struct ScriptedPublisher {
        pub failures: usize,
        pub droppable: bool,
        pub attempts: AtomicUsize,
        pub published: Mutex<Vec<Task>>,
    }

    impl ScriptedPublisher {
        pub fn failing(failures: usize) -> Self {
            Self {
                failures,
                ..Default::default()
            }
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn published(&self) -> Vec<Task> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Publisher for ScriptedPublisher {
        async fn publish(&self, task: &Task) -> Result<(), TaskError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(if self.droppable {
                    TaskError::droppable("rejected")
                } else {
                    TaskError::retryable(format!("attempt {} failed", attempt + 1))
                });
            }
            self.published.lock().unwrap().push(task.clone());
            Ok(())
        }
    }
}
