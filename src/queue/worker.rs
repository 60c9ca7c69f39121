//! Task dispatch
//!
//! The [`Worker`] routes a task to the handlers registered for its type,
//! wrapped in a middleware chain. Droppable errors are logged and turned
//! into success so the queue acknowledges the task.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::metrics;
use crate::queue::task::Task;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), TaskError>;
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, task: &Task, next: Next<'_>) -> Result<(), TaskError>;
}

/// Remainder of the middleware chain plus the terminal handlers
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    handlers: &'a [Arc<dyn TaskHandler>],
}

impl<'a> Next<'a> {
    pub async fn run(self, task: &Task) -> Result<(), TaskError> {
        match self.middlewares.split_first() {
            Some((first, rest)) => {
                first
                    .handle(
                        task,
                        Next {
                            middlewares: rest,
                            handlers: self.handlers,
                        },
                    )
                    .await
            }
            None => {
                for handler in self.handlers {
                    handler.handle(task).await?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Default)]
pub struct Worker {
    handlers: HashMap<String, Vec<Arc<dyn TaskHandler>>>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Worker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type. Several handlers for one type run in order.
    pub fn with_handler(mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.entry(task_type.into()).or_default().push(handler);
        self
    }

    /// Append a middleware; the first registered runs outermost
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[async_trait]
impl TaskHandler for Worker {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        let Some(handlers) = self.handlers.get(&task.task_type) else {
            return Err(TaskError::retryable(format!(
                "no handler registered for task type {:?}, registered types: {:?}",
                task.task_type,
                self.registered_types()
            )));
        };

        let next = Next {
            middlewares: &self.middlewares,
            handlers,
        };

        match next.run(task).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_droppable() => {
                warn!(
                    task_type = %task.task_type,
                    task_id = task.id().unwrap_or_default(),
                    "Dropping task: {}",
                    err
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Records processing duration and outcome per task type
pub struct MetricsMiddleware;

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(&self, task: &Task, next: Next<'_>) -> Result<(), TaskError> {
        let start = Instant::now();
        let result = next.run(task).await;
        let elapsed = start.elapsed();

        let outcome = match &result {
            Ok(()) => "success",
            Err(err) if err.is_droppable() => "dropped",
            Err(_) => "retry",
        };
        metrics::record_task_processed(&task.task_type, outcome, elapsed);
        debug!(task_type = %task.task_type, outcome, ?elapsed, "Task processed");

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        result: Result<(), TaskError>,
    }

    #[async_trait]
    impl TaskHandler for Recording {
        async fn handle(&self, _task: &Task) -> Result<(), TaskError> {
            self.log.lock().unwrap().push(self.name.to_string());
            self.result.clone()
        }
    }

    struct Tagging {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tagging {
        async fn handle(&self, task: &Task, next: Next<'_>) -> Result<(), TaskError> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            let result = next.run(task).await;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            result
        }
    }

    fn task(task_type: &str) -> Task {
        Task::new(task_type, BTreeMap::new(), vec![])
    }

    #[tokio::test]
    async fn test_middleware_wraps_handlers_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new()
            .with_middleware(Arc::new(Tagging { name: "outer", log: log.clone() }))
            .with_middleware(Arc::new(Tagging { name: "inner", log: log.clone() }))
            .with_handler("a", Arc::new(Recording { name: "h1", log: log.clone(), result: Ok(()) }))
            .with_handler("a", Arc::new(Recording { name: "h2", log: log.clone(), result: Ok(()) }));

        worker.handle(&task("a")).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "h1", "h2", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_droppable_error_is_acknowledged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new().with_handler(
            "a",
            Arc::new(Recording {
                name: "h",
                log,
                result: Err(TaskError::droppable("malformed")),
            }),
        );

        assert!(worker.handle(&task("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_retryable_error_is_returned() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new()
            .with_middleware(Arc::new(MetricsMiddleware))
            .with_handler(
                "a",
                Arc::new(Recording {
                    name: "h",
                    log,
                    result: Err(TaskError::retryable("db down")),
                }),
            );

        let err = worker.handle(&task("a")).await.unwrap_err();
        assert_eq!(err, TaskError::retryable("db down"));
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_an_error() {
        let worker = Worker::new();
        let err = worker.handle(&task("unknown")).await.unwrap_err();
        assert!(!err.is_droppable());
        assert!(err.to_string().contains("unknown"));
    }
}
