//! Collapse repeated requests inside one call before they reach the
//! wrapped backend

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::batched::{
    AppendHitsRequest, BatchRequest, BatchResponse, BatchedIoBackend, BucketId, CleanupRequest,
    CleanupResponse, GetProtoSessionHitsRequest, IdentifierConflictRequest,
    IdentifierConflictResponse, MarkClosingForBucketRequest,
};
use crate::error::BackendError;

enum Slot {
    /// No identifier of this type on the hit
    Absent,
    /// Forwarded to the inner backend at this index
    Forwarded(usize),
    /// Same identifier as an earlier forwarded request
    Repeated(usize),
}

/// Wraps a backend, forwarding each identifier, proto-session and bucket
/// mark only once per call. The inner backend stays the source of truth.
pub struct DeduplicatingBackend {
    inner: Arc<dyn BatchedIoBackend>,
}

impl DeduplicatingBackend {
    pub fn new(inner: Arc<dyn BatchedIoBackend>) -> Self {
        Self { inner }
    }
}

/// Index of `key` among the unique keys, pushing a new entry if unseen
fn dedup_index<K: std::hash::Hash + Eq>(seen: &mut HashMap<K, usize>, key: K, next: usize) -> (usize, bool) {
    match seen.get(&key) {
        Some(&index) => (index, false),
        None => {
            seen.insert(key, next);
            (next, true)
        }
    }
}

fn answer_at<T: Clone>(answers: &[Result<T, BackendError>], index: usize) -> Result<T, BackendError> {
    answers
        .get(index)
        .cloned()
        .unwrap_or_else(|| Err(BackendError::Storage("inner backend skipped a request".into())))
}

#[async_trait]
impl BatchedIoBackend for DeduplicatingBackend {
    async fn get_identifier_conflicts(
        &self,
        requests: &[IdentifierConflictRequest],
    ) -> Vec<Result<IdentifierConflictResponse, BackendError>> {
        let mut seen: HashMap<(&str, &str), usize> = HashMap::new();
        let mut unique: Vec<IdentifierConflictRequest> = Vec::new();
        let mut slots = Vec::with_capacity(requests.len());

        for request in requests {
            let Some(value) = request.hit.identifier(&request.identifier_type) else {
                slots.push(Slot::Absent);
                continue;
            };
            let (index, fresh) = dedup_index(&mut seen, (request.identifier_type.as_str(), value), unique.len());
            if fresh {
                unique.push(request.clone());
                slots.push(Slot::Forwarded(index));
            } else {
                slots.push(Slot::Repeated(index));
            }
        }

        let answers = if unique.is_empty() {
            Vec::new()
        } else {
            self.inner.get_identifier_conflicts(&unique).await
        };

        slots
            .into_iter()
            .zip(requests)
            .map(|(slot, request)| match slot {
                Slot::Absent => Ok(IdentifierConflictResponse::none()),
                Slot::Forwarded(index) => answer_at(&answers, index),
                Slot::Repeated(index) => {
                    let answer = answer_at(&answers, index)?;
                    // The identifier belongs to whoever owned it for the first request
                    let owner = if answer.has_conflict {
                        answer.conflicts_with
                    } else {
                        unique[index].hit.authoritative_client_id.clone()
                    };
                    Ok(if owner == request.hit.authoritative_client_id {
                        IdentifierConflictResponse::none()
                    } else {
                        IdentifierConflictResponse::with_owner(owner)
                    })
                }
            })
            .collect()
    }

    async fn handle_batch(&self, request: &BatchRequest) -> BatchResponse {
        let mut merged = BatchRequest::default();

        let mut append_seen: HashMap<&str, usize> = HashMap::new();
        let mut append_slots = Vec::with_capacity(request.append_hits.len());
        for req in &request.append_hits {
            let (index, fresh) = dedup_index(&mut append_seen, req.proto_session_id.as_str(), merged.append_hits.len());
            if fresh {
                merged.append_hits.push(AppendHitsRequest {
                    proto_session_id: req.proto_session_id.clone(),
                    hits: Vec::new(),
                });
            }
            let target = &mut merged.append_hits[index].hits;
            for hit in &req.hits {
                if !target.iter().any(|h| h.id == hit.id) {
                    target.push(hit.clone());
                }
            }
            append_slots.push(index);
        }

        let mut get_seen: HashMap<&str, usize> = HashMap::new();
        let mut get_slots = Vec::with_capacity(request.get_hits.len());
        for req in &request.get_hits {
            let (index, fresh) = dedup_index(&mut get_seen, req.proto_session_id.as_str(), merged.get_hits.len());
            if fresh {
                merged.get_hits.push(GetProtoSessionHitsRequest {
                    proto_session_id: req.proto_session_id.clone(),
                });
            }
            get_slots.push(index);
        }

        let mut mark_seen: HashMap<&str, usize> = HashMap::new();
        let mut mark_slots = Vec::with_capacity(request.mark_closing.len());
        for req in &request.mark_closing {
            let (index, fresh) = dedup_index(&mut mark_seen, req.proto_session_id.as_str(), merged.mark_closing.len());
            if fresh {
                merged.mark_closing.push(MarkClosingForBucketRequest {
                    proto_session_id: req.proto_session_id.clone(),
                    bucket_id: req.bucket_id,
                });
            } else {
                let existing = &mut merged.mark_closing[index].bucket_id;
                *existing = (*existing).max(req.bucket_id);
            }
            mark_slots.push(index);
        }

        let response = self.inner.handle_batch(&merged).await;

        BatchResponse {
            append_hits: append_slots.iter().map(|&i| answer_at(&response.append_hits, i)).collect(),
            get_hits: get_slots.iter().map(|&i| answer_at(&response.get_hits, i)).collect(),
            mark_closing: mark_slots.iter().map(|&i| answer_at(&response.mark_closing, i)).collect(),
        }
    }

    async fn get_all_protosessions_for_bucket(
        &self,
        bucket_ids: &[BucketId],
    ) -> Vec<Result<Vec<String>, BackendError>> {
        self.inner.get_all_protosessions_for_bucket(bucket_ids).await
    }

    async fn cleanup(&self, request: &CleanupRequest) -> CleanupResponse {
        self.inner.cleanup(request).await
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.inner.stop().await
    }
}
