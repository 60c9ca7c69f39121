//! Durable task queue
//!
//! Two interchangeable backends share the [`Publisher`] / [`Consumer`]
//! contract: publish appends, consume delivers in publish-time order and
//! deletes a task only after its handler succeeded. A crash between
//! handler success and deletion redelivers the task.

pub mod filesystem;
pub mod message_format;
pub mod objectstorage;
pub mod task;
pub mod worker;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{QueueError, TaskError};
use crate::signals::ShutdownSignal;
use task::Task;
use worker::TaskHandler;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, task: &Task) -> Result<(), TaskError>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Run one listing pass, returning how many tasks were acknowledged
    async fn consume_once(&self, handler: &dyn TaskHandler) -> Result<usize, QueueError>;

    /// Poll until shutdown is broadcast
    async fn consume(
        &self,
        handler: &dyn TaskHandler,
        shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> Result<(), QueueError>;
}
