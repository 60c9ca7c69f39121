//! Single-machine queue backed by a directory of `<nanos>.task` files
//!
//! Intended for development and all-in-one deployments: the directory
//! cannot be shared between machines.

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, TaskError};
use crate::queue::message_format::MessageFormat;
use crate::queue::task::Task;
use crate::queue::worker::TaskHandler;
use crate::queue::{Consumer, Publisher};
use crate::signals::ShutdownSignal;

const TASK_EXTENSION: &str = "task";
const LOCK_FILE: &str = ".consumer.lock";

/// Poll delay when the directory is empty or a handler failed
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct FilesystemQueue {
    directory: PathBuf,
    format: MessageFormat,
    poll_interval: Duration,
    last_stamp: Mutex<i64>,
}

impl FilesystemQueue {
    /// Open the queue, creating the directory if needed
    pub async fn new(directory: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;
        info!("Filesystem queue ready at {}", directory.display());

        Ok(Self {
            directory,
            format: MessageFormat::default(),
            poll_interval: POLL_INTERVAL,
            last_stamp: Mutex::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Strictly increasing nanosecond stamp so two publishes in the same
    /// nanosecond keep their order
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = match self.last_stamp.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = now.max(*last + 1);
        *last
    }

    /// Task files sorted by their timestamp prefix
    async fn list_tasks(&self) -> Result<Vec<(i64, PathBuf)>, QueueError> {
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        let mut tasks = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TASK_EXTENSION) {
                continue;
            }
            let stamp = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok());
            match stamp {
                Some(stamp) => tasks.push((stamp, path)),
                None => warn!("Skipping task file with unparsable name: {}", path.display()),
            }
        }

        tasks.sort();
        Ok(tasks)
    }

    fn acquire_lock(&self) -> Result<File, QueueError> {
        let path = self.directory.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| QueueError::Locked(self.directory.display().to_string()))?;
        Ok(file)
    }
}

#[async_trait]
impl Publisher for FilesystemQueue {
    async fn publish(&self, task: &Task) -> Result<(), TaskError> {
        let data = self.format.serialize(task)?;

        let tmp = self.directory.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| TaskError::retryable(format!("write {}: {}", tmp.display(), e)))?;

        // Another process may publish into the same directory
        let mut stamp = self.next_stamp();
        let mut target = self.directory.join(format!("{}.{}", stamp, TASK_EXTENSION));
        while tokio::fs::try_exists(&target).await.unwrap_or(false) {
            stamp = self.next_stamp();
            target = self.directory.join(format!("{}.{}", stamp, TASK_EXTENSION));
        }

        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| TaskError::retryable(format!("rename to {}: {}", target.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl Consumer for FilesystemQueue {
    async fn consume_once(&self, handler: &dyn TaskHandler) -> Result<usize, QueueError> {
        let mut processed = 0;

        for (_, path) in self.list_tasks().await? {
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                // Deleted by a previous pass that crashed mid-way
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if data.is_empty() {
                warn!("Removing empty task file {}", path.display());
                tokio::fs::remove_file(&path).await?;
                continue;
            }

            let task = match self.format.deserialize(&data) {
                Ok(task) => task,
                Err(e) => {
                    warn!("Removing undecodable task file {}: {}", path.display(), e);
                    tokio::fs::remove_file(&path).await?;
                    continue;
                }
            };

            match handler.handle(&task).await {
                Ok(()) => {}
                Err(e) if e.is_droppable() => {
                    warn!(task_type = %task.task_type, "Dropping task {}: {}", path.display(), e);
                }
                // Stop the pass so later tasks are not delivered ahead of this one
                Err(e) => return Err(QueueError::Handler(e)),
            }

            tokio::fs::remove_file(&path).await?;
            processed += 1;
        }

        Ok(processed)
    }

    async fn consume(
        &self,
        handler: &dyn TaskHandler,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> Result<(), QueueError> {
        let _lock = self.acquire_lock()?;
        info!("Consuming tasks from {}", self.directory.display());

        loop {
            let delay = match self.consume_once(handler).await {
                Ok(0) => self.poll_interval,
                Ok(_) => Duration::ZERO,
                Err(e) => {
                    error!("Filesystem queue pass failed: {}", e);
                    self.poll_interval
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Filesystem consumer shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
