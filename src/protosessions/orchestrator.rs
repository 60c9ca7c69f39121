//! Proto-session assembly
//!
//! For every hit batch (or ping) the [`Orchestrator`]:
//! 1. resolves identifier conflicts, one identifier type after another,
//! 2. appends hits per authoritative client id and marks each touched
//!    proto-session for the bucket of its new deadline,
//! 3. advances the timing wheel to the highest observed time,
//! 4. closes the proto-sessions of every fired bucket.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use super::batched::{
    AppendHitsRequest, BatchRequest, BatchedIoBackend, CleanupRequest, GetProtoSessionHitsRequest,
    IdentifierConflictRequest, MarkClosingForBucketRequest, RemoveBucketMetadataRequest,
    RemoveHitMetadataRequest, RemoveProtoSessionHitsRequest,
};
use super::closer::Closer;
use super::conflicts::{ConflictStrategy, Resolution, RewriteIdAndUpdateInPlace};
use super::timing_wheel::{BucketProcessor, FireOutcome, TimingWheel, WheelBucket};
use crate::error::TaskError;
use crate::hits::Hit;
use crate::metrics;
use crate::receiver::Storage;
use crate::signals::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Inactivity after the last hit that closes a session
    pub session_timeout: Duration,
    /// Identifier types checked for conflicts, in order
    pub identifier_types: Vec<String>,
}

struct HandlerState {
    shutdown: Option<broadcast::Receiver<ShutdownSignal>>,
    /// Once set, the wheel is no longer advanced
    shutting_down: bool,
}

pub struct Orchestrator {
    backend: Arc<dyn BatchedIoBackend>,
    wheel: TimingWheel,
    closer: Arc<dyn Closer>,
    strategy: Arc<dyn ConflictStrategy>,
    requeue: Option<Arc<dyn Storage>>,
    config: OrchestratorConfig,
    state: Mutex<HandlerState>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn BatchedIoBackend>,
        wheel: TimingWheel,
        closer: Arc<dyn Closer>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            wheel,
            closer,
            strategy: Arc::new(RewriteIdAndUpdateInPlace),
            requeue: None,
            config,
            state: Mutex::new(HandlerState {
                shutdown: None,
                shutting_down: false,
            }),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ConflictStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Where hits go when their session fails to close
    pub fn with_requeue(mut self, storage: Arc<dyn Storage>) -> Self {
        self.requeue = Some(storage);
        self
    }

    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<ShutdownSignal>) -> Self {
        self.state.get_mut().shutdown = Some(shutdown);
        self
    }

    pub fn wheel(&self) -> &TimingWheel {
        &self.wheel
    }

    fn deadline(&self, last_hit: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.config.session_timeout).unwrap_or(chrono::Duration::MAX);
        last_hit.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Process a hit batch, or an empty batch with a ping timestamp
    pub async fn handle(&self, mut hits: Vec<Hit>, ping: Option<DateTime<Utc>>) -> Result<(), TaskError> {
        let mut state = self.state.lock().await;
        let observed = hits.iter().map(|h| h.server_received_time).chain(ping).max();

        if !hits.is_empty() {
            let evicted = self.resolve_conflicts(&mut hits).await?;
            let (evicted, kept): (Vec<_>, Vec<_>) = hits.into_iter().zip(evicted).partition(|(_, e)| *e);
            self.store(
                kept.into_iter().map(|(hit, _)| hit).collect(),
                evicted.into_iter().map(|(hit, _)| hit).collect(),
            )
            .await?;
        }

        let Some(observed) = observed else {
            return Ok(());
        };

        if state.shutting_down {
            debug!("Shutting down, not advancing the timing wheel");
            return Ok(());
        }

        let report = self.wheel.advance(observed, self, state.shutdown.as_mut()).await?;
        if report.shutdown {
            state.shutting_down = true;
        }
        if report.fired > 0 {
            debug!(fired = report.fired, observed = %observed, "Advanced timing wheel");
        }
        Ok(())
    }

    /// Returns, per hit, whether the strategy asked to evict its owner.
    /// Evicted hits take no part in later identifier types.
    async fn resolve_conflicts(&self, hits: &mut [Hit]) -> Result<Vec<bool>, TaskError> {
        let mut evicted = vec![false; hits.len()];
        for identifier_type in &self.config.identifier_types {
            let indices: Vec<usize> = hits
                .iter()
                .enumerate()
                .filter(|(i, hit)| !evicted[*i] && hit.identifier(identifier_type).is_some())
                .map(|(i, _)| i)
                .collect();
            if indices.is_empty() {
                continue;
            }

            let requests: Vec<IdentifierConflictRequest> = indices
                .iter()
                .map(|&i| IdentifierConflictRequest {
                    hit: hits[i].clone(),
                    identifier_type: identifier_type.clone(),
                })
                .collect();

            let responses = self.backend.get_identifier_conflicts(&requests).await;
            let mut conflicts = 0;
            for (&i, response) in indices.iter().zip(responses) {
                let response = response.map_err(|e| {
                    warn!(identifier_type = %identifier_type, hit_id = %hits[i].id, "Identifier lookup failed: {}", e);
                    TaskError::from(e)
                })?;
                if response.has_conflict {
                    debug!(
                        hit_id = %hits[i].id,
                        from = %hits[i].authoritative_client_id,
                        to = %response.conflicts_with,
                        strategy = self.strategy.name(),
                        "Identifier conflict"
                    );
                    if self.strategy.resolve(&mut hits[i], &response.conflicts_with) == Resolution::Evict {
                        evicted[i] = true;
                    }
                    conflicts += 1;
                }
            }
            if conflicts > 0 {
                metrics::record_identifier_conflicts(identifier_type, conflicts);
            }
        }
        Ok(evicted)
    }

    /// Append `hits` per proto-session and schedule their deadlines. The
    /// proto-sessions `evicted` point at are read back in the same batch,
    /// requeued together with `evicted` and removed.
    async fn store(&self, hits: Vec<Hit>, mut evicted: Vec<Hit>) -> Result<(), TaskError> {
        let owners: BTreeSet<String> = evicted.iter().map(|h| h.authoritative_client_id.clone()).collect();
        if !owners.is_empty() && self.requeue.is_none() {
            error!(proto_sessions = owners.len(), "No requeue storage for evicted proto-sessions");
            return Err(TaskError::retryable("eviction needs a requeue storage"));
        }

        let mut grouped: BTreeMap<String, Vec<Hit>> = BTreeMap::new();
        for hit in hits {
            if owners.contains(&hit.authoritative_client_id) {
                evicted.push(hit);
            } else {
                grouped.entry(hit.authoritative_client_id.clone()).or_default().push(hit);
            }
        }

        let mut request = BatchRequest::default();
        let mut deadlines = Vec::with_capacity(grouped.len());
        for (proto_session_id, hits) in grouped {
            let Some(last) = hits.iter().map(|h| h.server_received_time).max() else {
                continue;
            };
            let deadline = self.deadline(last);
            request.mark_closing.push(MarkClosingForBucketRequest {
                proto_session_id: proto_session_id.clone(),
                bucket_id: self.wheel.bucket_for(deadline),
            });
            request.append_hits.push(AppendHitsRequest {
                proto_session_id: proto_session_id.clone(),
                hits,
            });
            deadlines.push((proto_session_id, deadline));
        }
        request.get_hits = owners
            .iter()
            .map(|id| GetProtoSessionHitsRequest { proto_session_id: id.clone() })
            .collect();

        let response = self.backend.handle_batch(&request).await;
        if let Some(e) = response
            .append_hits
            .iter()
            .chain(&response.mark_closing)
            .find_map(|r| r.as_ref().err())
        {
            warn!(sessions = deadlines.len(), "Failed to store hits: {}", e);
            return Err(e.clone().into());
        }

        for (proto_session_id, deadline) in &deadlines {
            self.wheel.schedule(proto_session_id, *deadline).await?;
        }

        if owners.is_empty() {
            return Ok(());
        }
        for (id, stored) in owners.iter().zip(response.get_hits) {
            let stored = stored.map_err(|e| {
                warn!(proto_session = %id, "Failed to read evicted proto-session: {}", e);
                TaskError::from(e)
            })?;
            evicted.extend(stored);
        }
        self.evict(&owners, evicted).await
    }

    async fn evict(&self, owners: &BTreeSet<String>, hits: Vec<Hit>) -> Result<(), TaskError> {
        let Some(requeue) = &self.requeue else {
            return Err(TaskError::retryable("eviction needs a requeue storage"));
        };
        let count = hits.len();
        requeue.push(hits).await.map_err(|e| {
            error!(proto_sessions = owners.len(), hits = count, "Requeueing evicted hits failed: {}", e);
            e
        })?;

        let request = CleanupRequest {
            remove_hits: owners
                .iter()
                .map(|id| RemoveProtoSessionHitsRequest { proto_session_id: id.clone() })
                .collect(),
            ..Default::default()
        };
        if let Some(e) = self.backend.cleanup(&request).await.first_error() {
            warn!(proto_sessions = owners.len(), "Removing evicted hits failed: {}", e);
            return Err(e.clone().into());
        }

        metrics::record_protosessions_evicted(owners.len(), count);
        info!(proto_sessions = owners.len(), hits = count, "Evicted proto-sessions");
        Ok(())
    }

    async fn cleanup(&self, bucket: &WheelBucket, proto_sessions: &[String]) -> Result<(), TaskError> {
        let request = CleanupRequest {
            remove_hits: proto_sessions
                .iter()
                .map(|id| RemoveProtoSessionHitsRequest { proto_session_id: id.clone() })
                .collect(),
            remove_metadata: proto_sessions
                .iter()
                .map(|id| RemoveHitMetadataRequest { proto_session_id: id.clone() })
                .collect(),
            remove_buckets: vec![RemoveBucketMetadataRequest { bucket_id: bucket.bucket_id }],
        };

        match self.backend.cleanup(&request).await.first_error() {
            Some(e) => {
                warn!(bucket_id = bucket.bucket_id, "Cleanup after close failed: {}", e);
                Err(e.clone().into())
            }
            None => Ok(()),
        }
    }

    pub async fn stop(&self) -> Result<(), TaskError> {
        self.backend.stop().await.map_err(TaskError::from)
    }
}

/// Sort hits by receive time and cut wherever two consecutive hits are
/// more than `timeout` apart
pub fn split_on_inactivity(mut hits: Vec<Hit>, timeout: Duration) -> Vec<Vec<Hit>> {
    hits.sort_by(|a, b| {
        a.server_received_time
            .cmp(&b.server_received_time)
            .then_with(|| a.id.cmp(&b.id))
    });
    let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);

    let mut sessions: Vec<Vec<Hit>> = Vec::new();
    for hit in hits {
        match sessions.last_mut() {
            Some(current)
                if current
                    .last()
                    .is_some_and(|prev| hit.server_received_time - prev.server_received_time <= timeout) =>
            {
                current.push(hit)
            }
            _ => sessions.push(vec![hit]),
        }
    }
    sessions
}

#[async_trait]
impl BucketProcessor for Orchestrator {
    async fn process(&self, bucket: &WheelBucket) -> Result<FireOutcome, TaskError> {
        let proto_sessions = self
            .backend
            .get_all_protosessions_for_bucket(&[bucket.bucket_id])
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| Ok(Vec::new()))?;

        if proto_sessions.is_empty() {
            debug!(bucket_id = bucket.bucket_id, "Bucket has no current proto-sessions");
            self.cleanup(bucket, &[]).await?;
            return Ok(FireOutcome::Closed);
        }

        let request = BatchRequest {
            get_hits: proto_sessions
                .iter()
                .map(|id| GetProtoSessionHitsRequest { proto_session_id: id.clone() })
                .collect(),
            ..Default::default()
        };
        let mut all_hits = Vec::new();
        let mut sessions = Vec::new();
        for (id, hits) in proto_sessions.iter().zip(self.backend.handle_batch(&request).await.get_hits) {
            let hits = hits.map_err(|e| {
                warn!(bucket_id = bucket.bucket_id, proto_session = %id, "Failed to read hits: {}", e);
                TaskError::from(e)
            })?;
            all_hits.extend(hits.iter().cloned());
            sessions.extend(split_on_inactivity(hits, self.config.session_timeout));
        }

        match self.closer.close(&sessions).await {
            Ok(()) => {
                metrics::record_sessions_closed(sessions.len(), all_hits.len());
                info!(
                    bucket_id = bucket.bucket_id,
                    sessions = sessions.len(),
                    hits = all_hits.len(),
                    "Closed sessions"
                );
            }
            Err(e) if e.is_droppable() => {
                warn!(bucket_id = bucket.bucket_id, sessions = sessions.len(), "Dropping sessions: {}", e);
            }
            Err(e) => {
                let Some(requeue) = &self.requeue else {
                    error!(bucket_id = bucket.bucket_id, "Closing sessions failed: {}", e);
                    return Err(e);
                };
                warn!(
                    bucket_id = bucket.bucket_id,
                    hits = all_hits.len(),
                    "Closing sessions failed, requeueing hits: {}",
                    e
                );
                requeue.push(all_hits).await.map_err(|requeue_err| {
                    error!(bucket_id = bucket.bucket_id, "Requeueing hits failed: {}", requeue_err);
                    TaskError::retryable(format!("close failed: {}; requeue failed: {}", e, requeue_err))
                })?;
                return Ok(FireOutcome::Deferred);
            }
        }

        self.cleanup(bucket, &proto_sessions).await?;
        Ok(FireOutcome::Closed)
    }
}
