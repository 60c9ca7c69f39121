use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::orchestrator::Orchestrator;
use crate::encoding::Codec;
use crate::error::TaskError;
use crate::hits::HitProcessingTask;
use crate::pings::is_ping;
use crate::queue::task::Task;
use crate::queue::worker::TaskHandler;

/// Worker handler for `process-hits` tasks
pub struct HitsTaskHandler {
    orchestrator: Arc<Orchestrator>,
    codec: Codec,
}

impl HitsTaskHandler {
    pub fn new(orchestrator: Arc<Orchestrator>, codec: Codec) -> Self {
        Self { orchestrator, codec }
    }
}

#[async_trait]
impl TaskHandler for HitsTaskHandler {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        if let (true, Some(timestamp)) = is_ping(&task.headers) {
            debug!(timestamp = %timestamp, "Received ping");
            return self.orchestrator.handle(Vec::new(), Some(timestamp)).await;
        }

        let batch: HitProcessingTask = self.codec.decode(&task.body).map_err(|e| {
            warn!(task_id = task.id().unwrap_or("-"), "Undecodable hit batch: {}", e);
            TaskError::from(e)
        })?;

        debug!(task_id = task.id().unwrap_or("-"), hits = batch.hits.len(), "Processing hits");
        self.orchestrator.handle(batch.hits, None).await
    }
}
