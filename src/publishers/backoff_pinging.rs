//! Pinger whose interval grows while the stream is idle
//!
//! Used when a ping is itself expensive, e.g. an object store write and
//! the listing it triggers downstream. Any real publish resets the
//! interval to its minimum.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::metrics;
use crate::pings::process_hits_ping_task;
use crate::queue::task::Task;
use crate::queue::Publisher;
use crate::signals::ShutdownSignal;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffPingConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub exp_factor: f64,
}

impl Default for BackoffPingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 5_000,
            max_interval_ms: 300_000,
            exp_factor: 1.5,
        }
    }
}

impl BackoffPingConfig {
    fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

#[derive(Debug)]
struct BackoffState {
    last_ping: Instant,
    last_real: Instant,
    current: Duration,
}

pub struct BackoffPingingPublisher {
    inner: Arc<dyn Publisher>,
    config: BackoffPingConfig,
    state: Mutex<BackoffState>,
}

impl BackoffPingingPublisher {
    pub fn new(inner: Arc<dyn Publisher>, config: BackoffPingConfig) -> Self {
        let now = Instant::now();
        let state = BackoffState {
            last_ping: now,
            last_real: now,
            current: config.min_interval(),
        };
        Self {
            inner,
            config,
            state: Mutex::new(state),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BackoffState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.with_state(|s| s.current)
    }

    /// Claim a ping slot at `now`, growing the interval when granted
    fn claim_ping(&self, now: Instant) -> bool {
        let max = self.config.max_interval();
        let factor = self.config.exp_factor;
        self.with_state(|s| {
            let since_ping = now.saturating_duration_since(s.last_ping);
            let since_real = now.saturating_duration_since(s.last_real);
            if since_ping > s.current && since_real >= s.current {
                s.last_ping = now;
                s.current = s.current.mul_f64(factor).min(max);
                true
            } else {
                false
            }
        })
    }

    /// Time until the next ping could be due
    fn next_due_in(&self, now: Instant) -> Duration {
        self.with_state(|s| {
            let anchor = s.last_ping.max(s.last_real);
            (anchor + s.current).saturating_duration_since(now) + Duration::from_millis(1)
        })
    }

    /// Publish a ping if one is due at `now`; returns whether it did
    pub async fn tick(&self, now: Instant) -> Result<bool, TaskError> {
        if !self.claim_ping(now) {
            return Ok(false);
        }
        self.inner.publish(&process_hits_ping_task(Utc::now())).await?;
        metrics::record_ping("backoff");
        debug!(next_interval = ?self.current_interval(), "Published backoff ping");
        Ok(true)
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait = self.next_due_in(Instant::now());
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Backoff pinger shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
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
impl Publisher for BackoffPingingPublisher {
    async fn publish(&self, task: &Task) -> Result<(), TaskError> {
        self.inner.publish(task).await?;
        let min = self.config.min_interval();
        self.with_state(|s| {
            s.last_real = Instant::now();
            s.current = min;
        });
        Ok(())
    }
}
