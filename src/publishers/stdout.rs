use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::json;
use std::io::Write;
use std::sync::Mutex;

use crate::error::TaskError;
use crate::queue::task::Task;
use crate::queue::Publisher;

/// Last-resort sink: one JSON line per task on stdout so an operator can
/// replay it from the logs.
pub struct StdoutPublisher<W: Write + Send = std::io::Stdout> {
    writer: Mutex<W>,
}

impl StdoutPublisher {
    pub fn new() -> Self {
        Self::with_writer(std::io::stdout())
    }
}

impl Default for StdoutPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> StdoutPublisher<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

fn recovery_line(task: &Task) -> Result<String, TaskError> {
    let headers = serde_json::to_string(&task.headers)
        .map_err(|e| TaskError::droppable(format!("encode headers: {}", e)))?;

    let line = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "level": "warning",
        "task_type": task.task_type,
        "headers": headers,
        "purpose": "recovery",
        "body": STANDARD.encode(&task.body),
    });
    Ok(line.to_string())
}

#[async_trait]
impl<W: Write + Send> Publisher for StdoutPublisher<W> {
    async fn publish(&self, task: &Task) -> Result<(), TaskError> {
        let line = recovery_line(task)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TaskError::retryable("stdout writer poisoned"))?;
        writeln!(writer, "{}", line)
            .and_then(|_| writer.flush())
            .map_err(|e| TaskError::retryable(format!("write recovery line: {}", e)))
    }
}
