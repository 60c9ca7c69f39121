use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::metrics;
use crate::pings::process_hits_ping_task;
use crate::queue::task::Task;
use crate::queue::Publisher;
use crate::signals::ShutdownSignal;

/// Emits a ping every `interval` unless a real task went out within the
/// last `interval`.
pub struct PingingPublisher {
    inner: Arc<dyn Publisher>,
    interval: Duration,
    last_publish: Mutex<Instant>,
}

impl PingingPublisher {
    pub fn new(inner: Arc<dyn Publisher>, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last_publish: Mutex::new(Instant::now()),
        }
    }

    fn last_publish(&self) -> Instant {
        match self.last_publish.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_publish()) >= self.interval
    }

    /// Publish a ping if one is due at `now`; returns whether it did
    pub async fn tick(&self, now: Instant) -> Result<bool, TaskError> {
        if !self.is_due(now) {
            return Ok(false);
        }
        self.inner.publish(&process_hits_ping_task(Utc::now())).await?;
        metrics::record_ping("periodic");
        debug!("Published periodic ping");
        Ok(true)
    }

    /// Spawn the tick loop
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Periodic pinger shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(Instant::now()).await {
                            warn!("Failed to publish ping: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Publisher for PingingPublisher {
    async fn publish(&self, task: &Task) -> Result<(), TaskError> {
        self.inner.publish(task).await?;
        if let Ok(mut last) = self.last_publish.lock() {
            *last = Instant::now();
        }
        Ok(())
    }
}
