//! Queue on top of an object store bucket
//!
//! Each task is one object keyed `<prefix>/<nanos>_<task id>`, so the
//! lexicographic listing order of a prefix is publish order. Several
//! queues can share a bucket under different prefixes. The bucket is a
//! local directory, or S3/GCS through [`ObjectStoreBucket`].

pub mod bucket;
pub mod consumer;
pub mod publisher;
pub mod remote;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::QueueError;

pub use bucket::{Bucket, InMemoryBucket, LocalDirBucket};
pub use consumer::ObjectStorageConsumer;
pub use publisher::ObjectStoragePublisher;
pub use remote::{ObjectStoreBucket, RemoteBucketOptions};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObjectStorageQueueConfig {
    /// Namespace of this queue inside the bucket
    pub prefix: String,
    pub max_items_per_batch: usize,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub interval_exp_factor: f64,
    pub processing_timeout_secs: u64,
    pub retry_attempts: u32,
}

impl Default for ObjectStorageQueueConfig {
    fn default() -> Self {
        Self {
            prefix: "queue".to_string(),
            max_items_per_batch: 1000,
            min_interval_ms: 5_000,
            max_interval_ms: 60_000,
            interval_exp_factor: 1.5,
            processing_timeout_secs: 300,
            retry_attempts: 3,
        }
    }
}

impl ObjectStorageQueueConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_items_per_batch == 0 {
            return Err(QueueError::Config("max_items_per_batch must be positive".into()));
        }
        if self.min_interval_ms == 0 {
            return Err(QueueError::Config("min_interval_ms must be positive".into()));
        }
        if self.min_interval_ms > self.max_interval_ms {
            return Err(QueueError::Config(format!(
                "min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        if self.interval_exp_factor.is_nan() || self.interval_exp_factor <= 0.0 {
            return Err(QueueError::Config(format!(
                "interval_exp_factor must be positive, got {}",
                self.interval_exp_factor
            )));
        }
        if self.processing_timeout_secs == 0 {
            return Err(QueueError::Config("processing_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// Prefix used when listing, always ending in `/` so `envA/q` never
    /// matches objects of `envA/q2`
    pub(crate) fn list_prefix(&self) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        }
    }
}

/// Timestamp prefix of a queue object key, `None` when the key does not
/// have the `<digits>_<id>` shape
pub fn parse_key_timestamp(key: &str) -> Option<i64> {
    let name = key.rsplit('/').next()?;
    let (stamp, rest) = name.split_once('_')?;
    if rest.is_empty() {
        return None;
    }
    stamp.parse::<i64>().ok()
}

/// Exponential poll delay: grows while the queue is idle, resets on work
#[derive(Debug, Clone)]
pub struct PollBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    factor: f64,
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self {
            current: min,
            min,
            max,
            factor,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to sleep after an empty batch; grows the next one
    pub fn on_empty(&mut self) -> Duration {
        let sleep = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.max);
        sleep
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ObjectStorageQueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_items_per_batch, 1000);
        assert_eq!(config.min_interval(), Duration::from_secs(5));
        assert_eq!(config.max_interval(), Duration::from_secs(60));
        assert_eq!(config.processing_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_inverted_intervals() {
        let config = ObjectStorageQueueConfig {
            min_interval_ms: 10_000,
            max_interval_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ObjectStorageQueueConfig {
            interval_exp_factor: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_list_prefix() {
        let mut config = ObjectStorageQueueConfig::default();
        config.prefix = "envA/q/".to_string();
        assert_eq!(config.list_prefix(), "envA/q/");

        config.prefix = String::new();
        assert_eq!(config.list_prefix(), "");
    }

    #[test]
    fn test_parse_key_timestamp() {
        assert_eq!(parse_key_timestamp("q/1700000000000000000_abc"), Some(1_700_000_000_000_000_000));
        assert_eq!(parse_key_timestamp("12_x"), Some(12));
        assert_eq!(parse_key_timestamp("q/readme.txt"), None);
        assert_eq!(parse_key_timestamp("q/abc_def"), None);
        assert_eq!(parse_key_timestamp("q/12_"), None);
    }

    #[test]
    fn test_backoff_grows_caps_and_resets() {
        let mut backoff = PollBackoff::new(Duration::from_secs(5), Duration::from_secs(10), 1.5);

        assert_eq!(backoff.on_empty(), Duration::from_secs(5));
        assert_eq!(backoff.current(), Duration::from_millis(7500));
        assert_eq!(backoff.on_empty(), Duration::from_millis(7500));
        assert_eq!(backoff.current(), Duration::from_secs(10));
        assert_eq!(backoff.on_empty(), Duration::from_secs(10));
        assert_eq!(backoff.current(), Duration::from_secs(10));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }
}
