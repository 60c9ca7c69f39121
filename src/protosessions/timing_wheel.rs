//! Timing wheel persisted in a [`Kv`]
//!
//! Deadlines are quantised into buckets of `bucket_width`. Each bucket is
//! one key whose value holds the bucket id, the latest deadline scheduled
//! into it and its sessions. A single cursor key holds the highest
//! observed time. Observed time only ever comes from hits and pings, never
//! from the wall clock.
//!
//! Bucket keys are zero-padded so ascending key order is ascending bucket
//! order, and bucket deadlines of distinct buckets never interleave.
//!
//! An advance writes the cursor as `max(cursor, observed)` before firing
//! anything. The cursor is not tied to the fired buckets: a bucket left by
//! a failure, a deferral or a shutdown stays due and fires on the next
//! advance, whatever that advance observes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::batched::BucketId;
use crate::error::{StorageError, TaskError};
use crate::metrics;
use crate::signals::{shutdown_requested, ShutdownSignal};
use crate::storage::{Kv, SetOptions};

pub const DEFAULT_BUCKET_WIDTH: Duration = Duration::from_secs(1);

/// Buckets loaded per listing pass
const LIST_PAGE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelBucket {
    pub bucket_id: BucketId,
    pub deadline: DateTime<Utc>,
    pub sessions: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// The bucket is done and can be forgotten
    Closed,
    /// Keep the bucket and stop advancing for now
    Deferred,
}

/// Callback run for every bucket whose deadline has passed
#[async_trait]
pub trait BucketProcessor: Send + Sync {
    async fn process(&self, bucket: &WheelBucket) -> Result<FireOutcome, TaskError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceReport {
    pub fired: usize,
    /// A processor asked to keep its bucket
    pub deferred: bool,
    /// Shutdown was requested between firings
    pub shutdown: bool,
}

pub struct TimingWheel {
    kv: Arc<dyn Kv>,
    name: String,
    bucket_width: Duration,
}

impl TimingWheel {
    pub fn new(kv: Arc<dyn Kv>, name: impl Into<String>, bucket_width: Duration) -> Self {
        let bucket_width = if bucket_width.is_zero() {
            DEFAULT_BUCKET_WIDTH
        } else {
            bucket_width
        };
        Self {
            kv,
            name: name.into(),
            bucket_width,
        }
    }

    fn bucket_prefix(&self) -> String {
        format!("timingwheel.{}.buckets.", self.name)
    }

    fn bucket_key(&self, bucket_id: BucketId) -> String {
        format!("{}{:020}", self.bucket_prefix(), bucket_id)
    }

    fn cursor_key(&self) -> String {
        format!("timingwheel.{}.cursor", self.name)
    }

    /// `floor(deadline / bucket_width)`; pre-epoch deadlines land in bucket 0
    pub fn bucket_for(&self, deadline: DateTime<Utc>) -> BucketId {
        let millis = u64::try_from(deadline.timestamp_millis()).unwrap_or(0);
        let width = u64::try_from(self.bucket_width.as_millis()).unwrap_or(u64::MAX).max(1);
        millis / width
    }

    async fn load_bucket(&self, key: &str) -> Result<Option<WheelBucket>, StorageError> {
        match self.kv.get(key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Highest observed time so far
    pub async fn cursor(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let key = self.cursor_key();
        match self.kv.get(&key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
        }
    }

    /// Add a session to the bucket of `deadline` and return that bucket id
    pub async fn schedule(&self, proto_session_id: &str, deadline: DateTime<Utc>) -> Result<BucketId, StorageError> {
        let bucket_id = self.bucket_for(deadline);
        let key = self.bucket_key(bucket_id);

        let bucket = match self.load_bucket(&key).await? {
            Some(mut bucket) => {
                bucket.deadline = bucket.deadline.max(deadline);
                bucket.sessions.insert(proto_session_id.to_string());
                bucket
            }
            None => WheelBucket {
                bucket_id,
                deadline,
                sessions: BTreeSet::from([proto_session_id.to_string()]),
            },
        };

        self.kv
            .set(&key, &serde_json::to_vec(&bucket)?, SetOptions::default())
            .await?;
        debug!(bucket_id, session = %proto_session_id, deadline = %bucket.deadline, "Scheduled proto-session");
        Ok(bucket_id)
    }

    /// Buckets still waiting to fire, in firing order
    pub async fn pending(&self) -> Result<Vec<WheelBucket>, StorageError> {
        let mut buckets = Vec::new();
        for key in self.kv.keys(&self.bucket_prefix(), usize::MAX).await? {
            if let Some(bucket) = self.load_bucket(&key).await? {
                buckets.push(bucket);
            }
        }
        Ok(buckets)
    }

    /// Move observed time to `max(cursor, observed)` and fire every bucket
    /// whose deadline is at or before it, oldest first.
    ///
    /// A failing processor leaves its bucket in place and returns the
    /// error. Shutdown is checked between firings.
    pub async fn advance(
        &self,
        observed: DateTime<Utc>,
        processor: &dyn BucketProcessor,
        mut shutdown: Option<&mut broadcast::Receiver<ShutdownSignal>>,
    ) -> Result<AdvanceReport, TaskError> {
        let cursor = match self.cursor().await? {
            Some(cursor) if cursor >= observed => cursor,
            _ => {
                self.kv
                    .set(&self.cursor_key(), &serde_json::to_vec(&observed).map_err(StorageError::from)?, SetOptions::default())
                    .await?;
                observed
            }
        };

        let mut report = AdvanceReport::default();
        let prefix = self.bucket_prefix();

        loop {
            let keys = self.kv.keys(&prefix, LIST_PAGE).await?;
            let page_len = keys.len();

            for key in keys {
                if let Some(rx) = shutdown.as_deref_mut() {
                    if shutdown_requested(rx) {
                        info!(fired = report.fired, "Shutdown requested, leaving remaining buckets");
                        report.shutdown = true;
                        return Ok(report);
                    }
                }

                let Some(bucket) = self.load_bucket(&key).await? else {
                    continue;
                };
                if bucket.deadline > cursor {
                    return Ok(report);
                }

                match processor.process(&bucket).await {
                    Ok(FireOutcome::Closed) => {
                        self.kv.delete(&key).await?;
                        metrics::record_bucket_fired();
                        report.fired += 1;
                        debug!(bucket_id = bucket.bucket_id, deadline = %bucket.deadline, "Fired bucket");
                    }
                    Ok(FireOutcome::Deferred) => {
                        info!(bucket_id = bucket.bucket_id, "Bucket deferred");
                        report.deferred = true;
                        return Ok(report);
                    }
                    Err(e) => {
                        warn!(bucket_id = bucket.bucket_id, "Failed to fire bucket: {}", e);
                        return Err(e);
                    }
                }
            }

            if page_len < LIST_PAGE {
                return Ok(report);
            }
        }
    }
}
