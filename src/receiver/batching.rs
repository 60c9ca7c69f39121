//! Size and timeout bounded hit buffer
//!
//! Hits accumulate until either `batch_size` are buffered or
//! `batch_timeout` has passed since the oldest unflushed hit. A flush
//! hands the whole buffer to the inner storage as one batch.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::Storage;
use crate::error::TaskError;
use crate::hits::Hit;
use crate::metrics;
use crate::signals::ShutdownSignal;

#[derive(Default)]
struct Buffer {
    hits: Vec<Hit>,
    oldest: Option<Instant>,
}

impl Buffer {
    fn take(&mut self) -> Vec<Hit> {
        self.oldest = None;
        std::mem::take(&mut self.hits)
    }
}

pub struct BatchingStorage {
    inner: Arc<dyn Storage>,
    batch_size: usize,
    batch_timeout: Duration,
    buffer: Mutex<Buffer>,
}

impl BatchingStorage {
    /// Create a buffer in front of `inner`
    ///
    /// # Arguments
    ///
    /// * `inner` - Storage receiving each flushed batch
    /// * `batch_size` - Hits per batch before an immediate flush
    /// * `batch_timeout` - Max age of the oldest buffered hit
    ///
    /// # Example
    ///
    /// ```ignore
    /// let storage = Arc::new(BatchingStorage::new(publishing, 500, Duration::from_secs(1)));
    /// let flusher = storage.clone().spawn_flush_loop(shutdown_tx.subscribe());
    /// storage.push(hits).await?;
    /// ```
    pub fn new(inner: Arc<dyn Storage>, batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
            batch_timeout,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.hits.len()
    }

    /// Flush if the oldest buffered hit has waited at least `batch_timeout`
    pub async fn flush_expired(&self) -> Result<(), TaskError> {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            match buffer.oldest {
                Some(oldest) if oldest.elapsed() >= self.batch_timeout => buffer.take(),
                _ => return Ok(()),
            }
        };
        self.flush(batch).await
    }

    /// Flush whatever is buffered
    pub async fn close(&self) -> Result<(), TaskError> {
        let batch = self.buffer.lock().await.take();
        self.flush(batch).await
    }

    async fn flush(&self, batch: Vec<Hit>) -> Result<(), TaskError> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        match self.inner.push(batch).await {
            Ok(()) => {
                debug!(count, "Flushed hit batch");
                Ok(())
            }
            Err(e) => {
                error!(count, "Failed to flush hit batch: {}", e);
                Err(e)
            }
        }
    }

    /// Spawn the timeout flush loop. It flushes the remainder on shutdown.
    pub fn spawn_flush_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        let tick = (self.batch_timeout / 4).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut flush_timer = tokio::time::interval(tick);
            flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Batch flush loop shutting down");
                        if let Err(e) = self.close().await {
                            debug!("Final flush on shutdown failed: {}", e);
                        }
                        break;
                    }
                    _ = flush_timer.tick() => {
                        if let Err(e) = self.flush_expired().await {
                            debug!("Timed flush failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Storage for BatchingStorage {
    async fn push(&self, hits: Vec<Hit>) -> Result<(), TaskError> {
        if hits.is_empty() {
            return Ok(());
        }
        metrics::record_hits_received(hits.len());

        let batch = {
            let mut buffer = self.buffer.lock().await;
            if buffer.oldest.is_none() {
                buffer.oldest = Some(Instant::now());
            }
            buffer.hits.extend(hits);
            if buffer.hits.len() < self.batch_size {
                return Ok(());
            }
            buffer.take()
        };
        self.flush(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        batches: StdMutex<Vec<Vec<Hit>>>,
    }

    #[async_trait]
    impl Storage for Recorder {
        async fn push(&self, hits: Vec<Hit>) -> Result<(), TaskError> {
            self.batches.lock().unwrap().push(hits);
            Ok(())
        }
    }

    impl Recorder {
        fn sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    fn hits(n: usize) -> Vec<Hit> {
        (0..n)
            .map(|i| Hit::new(format!("h{}", i), "c1", Utc::now()))
            .collect()
    }

    #[tokio::test]
    async fn test_flushes_when_batch_is_full() {
        let recorder = Arc::new(Recorder::default());
        let storage = BatchingStorage::new(recorder.clone(), 3, Duration::from_secs(60));

        storage.push(hits(2)).await.unwrap();
        assert!(recorder.sizes().is_empty());
        assert_eq!(storage.buffered().await, 2);

        storage.push(hits(2)).await.unwrap();
        assert_eq!(recorder.sizes(), vec![4]);
        assert_eq!(storage.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_flush_expired_waits_for_timeout() {
        let recorder = Arc::new(Recorder::default());
        let storage = BatchingStorage::new(recorder.clone(), 100, Duration::from_millis(30));

        storage.push(hits(1)).await.unwrap();
        storage.flush_expired().await.unwrap();
        assert!(recorder.sizes().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        storage.flush_expired().await.unwrap();
        assert_eq!(recorder.sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_flush_loop_and_close_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let storage = Arc::new(BatchingStorage::new(recorder.clone(), 100, Duration::from_millis(20)));
        let shutdown_tx = crate::signals::shutdown_channel();
        let handle = storage.clone().spawn_flush_loop(shutdown_tx.subscribe());

        storage.push(hits(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(recorder.sizes(), vec![2]);

        storage.push(hits(1)).await.unwrap();
        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.unwrap();
        assert_eq!(recorder.sizes(), vec![2, 1]);
    }

    struct Unavailable {
        attempts: StdMutex<usize>,
    }

    #[async_trait]
    impl Storage for Unavailable {
        async fn push(&self, _hits: Vec<Hit>) -> Result<(), TaskError> {
            *self.attempts.lock().unwrap() += 1;
            Err(TaskError::retryable("queue unavailable"))
        }
    }

    #[tokio::test]
    async fn test_flush_loop_survives_failing_storage() {
        let inner = Arc::new(Unavailable {
            attempts: StdMutex::new(0),
        });
        let storage = Arc::new(BatchingStorage::new(inner.clone(), 100, Duration::from_millis(20)));
        let shutdown_tx = crate::signals::shutdown_channel();
        let handle = storage.clone().spawn_flush_loop(shutdown_tx.subscribe());

        storage.push(hits(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(*inner.attempts.lock().unwrap(), 1);

        storage.push(hits(1)).await.unwrap();
        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(*inner.attempts.lock().unwrap(), 2);
        assert_eq!(storage.buffered().await, 0);
    }
}
