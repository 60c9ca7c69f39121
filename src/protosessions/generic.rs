//! Proto-session backend over any [`Kv`] + [`Set`] pair
//!
//! Not transactional: every request is applied on its own and fails only
//! its own position. Set semantics make redelivered hits harmless.

use async_trait::async_trait;
use std::sync::Arc;

use super::batched::{
    BatchRequest, BatchResponse, BatchedIoBackend, BucketId, CleanupRequest, CleanupResponse,
    IdentifierConflictRequest, IdentifierConflictResponse,
};
use crate::error::BackendError;
use crate::hits::Hit;
use crate::storage::{Kv, Set, SetOptions};

fn identifier_key(identifier_type: &str, value: &str) -> String {
    format!("ids.{}.{}", identifier_type, value)
}

fn owned_identifiers_key(proto_session_id: &str) -> String {
    format!("sessions.ids.{}", proto_session_id)
}

fn hits_key(proto_session_id: &str) -> String {
    format!("sessions.hits.{}", proto_session_id)
}

fn bucket_key(bucket_id: BucketId) -> String {
    format!("sessions.buckets.{}", bucket_id)
}

fn bucket_of_key(proto_session_id: &str) -> String {
    format!("sessions.bucket_of.{}", proto_session_id)
}

pub struct KvBatchedIoBackend {
    kv: Arc<dyn Kv>,
    sets: Arc<dyn Set>,
}

impl KvBatchedIoBackend {
    pub fn new(kv: Arc<dyn Kv>, sets: Arc<dyn Set>) -> Self {
        Self { kv, sets }
    }

    async fn claim(&self, request: &IdentifierConflictRequest) -> Result<IdentifierConflictResponse, BackendError> {
        let Some(value) = request.hit.identifier(&request.identifier_type) else {
            return Ok(IdentifierConflictResponse::none());
        };
        let owner = &request.hit.authoritative_client_id;
        let key = identifier_key(&request.identifier_type, value);

        let previous = self
            .kv
            .set(
                &key,
                owner.as_bytes(),
                SetOptions {
                    skip_if_exists: true,
                    return_previous: true,
                },
            )
            .await?;

        match previous {
            None => {
                self.sets.add(&owned_identifiers_key(owner), key.as_bytes()).await?;
                Ok(IdentifierConflictResponse::none())
            }
            Some(current) if current == owner.as_bytes() => Ok(IdentifierConflictResponse::none()),
            Some(current) => Ok(IdentifierConflictResponse::with_owner(
                String::from_utf8_lossy(&current).into_owned(),
            )),
        }
    }

    async fn append(&self, proto_session_id: &str, hits: &[Hit]) -> Result<(), BackendError> {
        let key = hits_key(proto_session_id);
        for hit in hits {
            self.sets.add(&key, &serde_json::to_vec(hit)?).await?;
        }
        Ok(())
    }

    async fn hits(&self, proto_session_id: &str) -> Result<Vec<Hit>, BackendError> {
        let mut hits = self
            .sets
            .all(&hits_key(proto_session_id))
            .await?
            .iter()
            .map(|encoded| serde_json::from_slice::<Hit>(encoded))
            .collect::<Result<Vec<_>, _>>()?;
        hits.sort_by(|a, b| {
            a.server_received_time
                .cmp(&b.server_received_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(hits)
    }

    async fn latest_bucket(&self, proto_session_id: &str) -> Result<Option<BucketId>, BackendError> {
        let key = bucket_of_key(proto_session_id);
        match self.kv.get(&key).await? {
            None => Ok(None),
            Some(bytes) => {
                let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    BackendError::Decode(format!("bucket id under {} has {} bytes", key, bytes.len()))
                })?;
                Ok(Some(BucketId::from_be_bytes(array)))
            }
        }
    }

    async fn mark(&self, proto_session_id: &str, bucket_id: BucketId) -> Result<(), BackendError> {
        self.sets
            .add(&bucket_key(bucket_id), proto_session_id.as_bytes())
            .await?;
        let newer = match self.latest_bucket(proto_session_id).await? {
            Some(current) => bucket_id > current,
            None => true,
        };
        if newer {
            self.kv
                .set(&bucket_of_key(proto_session_id), &bucket_id.to_be_bytes(), SetOptions::default())
                .await?;
        }
        Ok(())
    }

    async fn members(&self, bucket_id: BucketId) -> Result<Vec<String>, BackendError> {
        let mut latest = Vec::new();
        for member in self.sets.all(&bucket_key(bucket_id)).await? {
            let session = String::from_utf8_lossy(&member).into_owned();
            if self.latest_bucket(&session).await? == Some(bucket_id) {
                latest.push(session);
            }
        }
        Ok(latest)
    }

    async fn release_metadata(&self, proto_session_id: &str) -> Result<(), BackendError> {
        let owned = owned_identifiers_key(proto_session_id);
        for key in self.sets.all(&owned).await? {
            let key = String::from_utf8_lossy(&key).into_owned();
            // Only release identifiers this session still owns
            if self.kv.get(&key).await?.as_deref() == Some(proto_session_id.as_bytes()) {
                self.kv.delete(&key).await?;
            }
        }
        self.sets.drop_key(&owned).await?;
        self.kv.delete(&bucket_of_key(proto_session_id)).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchedIoBackend for KvBatchedIoBackend {
    async fn get_identifier_conflicts(
        &self,
        requests: &[IdentifierConflictRequest],
    ) -> Vec<Result<IdentifierConflictResponse, BackendError>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.claim(request).await);
        }
        responses
    }

    async fn handle_batch(&self, request: &BatchRequest) -> BatchResponse {
        let mut response = BatchResponse::default();
        for req in &request.append_hits {
            response
                .append_hits
                .push(self.append(&req.proto_session_id, &req.hits).await);
        }
        for req in &request.get_hits {
            response.get_hits.push(self.hits(&req.proto_session_id).await);
        }
        for req in &request.mark_closing {
            response
                .mark_closing
                .push(self.mark(&req.proto_session_id, req.bucket_id).await);
        }
        response
    }

    async fn get_all_protosessions_for_bucket(
        &self,
        bucket_ids: &[BucketId],
    ) -> Vec<Result<Vec<String>, BackendError>> {
        let mut responses = Vec::with_capacity(bucket_ids.len());
        for &bucket_id in bucket_ids {
            responses.push(self.members(bucket_id).await);
        }
        responses
    }

    async fn cleanup(&self, request: &CleanupRequest) -> CleanupResponse {
        let mut response = CleanupResponse::default();
        for req in &request.remove_hits {
            let result = self
                .sets
                .drop_key(&hits_key(&req.proto_session_id))
                .await
                .map_err(BackendError::from);
            response.remove_hits.push(result);
        }
        for req in &request.remove_metadata {
            response
                .remove_metadata
                .push(self.release_metadata(&req.proto_session_id).await);
        }
        for req in &request.remove_buckets {
            let result = self
                .sets
                .drop_key(&bucket_key(req.bucket_id))
                .await
                .map_err(BackendError::from);
            response.remove_buckets.push(result);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hits::{SESSION_STAMP_IDENTIFIER, USER_ID_IDENTIFIER};
    use crate::protosessions::batched::{
        AppendHitsRequest, GetProtoSessionHitsRequest, MarkClosingForBucketRequest,
        RemoveBucketMetadataRequest, RemoveHitMetadataRequest, RemoveProtoSessionHitsRequest,
    };
    use crate::storage::{InMemoryKv, InMemorySet};
    use chrono::{TimeZone, Utc};

    fn backend() -> KvBatchedIoBackend {
        KvBatchedIoBackend::new(Arc::new(InMemoryKv::new()), Arc::new(InMemorySet::new()))
    }

    fn hit(id: &str, client: &str, secs: i64) -> Hit {
        Hit::new(id, client, Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[tokio::test]
    async fn test_identifier_ownership() {
        let backend = backend();
        let requests = vec![
            IdentifierConflictRequest {
                hit: hit("h1", "c1", 0).with_user_id("u1"),
                identifier_type: USER_ID_IDENTIFIER.into(),
            },
            IdentifierConflictRequest {
                hit: hit("h2", "c2", 1).with_user_id("u1"),
                identifier_type: USER_ID_IDENTIFIER.into(),
            },
            IdentifierConflictRequest {
                hit: hit("h3", "c2", 1),
                identifier_type: SESSION_STAMP_IDENTIFIER.into(),
            },
        ];

        let responses = backend.get_identifier_conflicts(&requests).await;
        assert_eq!(responses[0], Ok(IdentifierConflictResponse::none()));
        assert_eq!(responses[1], Ok(IdentifierConflictResponse::with_owner("c1")));
        assert_eq!(responses[2], Ok(IdentifierConflictResponse::none()));
    }

    #[tokio::test]
    async fn test_hits_sorted_and_deduplicated() {
        let backend = backend();
        let request = BatchRequest {
            append_hits: vec![AppendHitsRequest {
                proto_session_id: "c1".into(),
                hits: vec![hit("h2", "c1", 20), hit("h1", "c1", 10), hit("h2", "c1", 20)],
            }],
            get_hits: vec![GetProtoSessionHitsRequest { proto_session_id: "c1".into() }],
            ..Default::default()
        };

        let response = backend.handle_batch(&request).await;
        let hits = response.get_hits[0].clone().unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn test_stale_bucket_members_are_skipped() {
        let backend = backend();
        for bucket_id in [5, 9, 7] {
            backend
                .handle_batch(&BatchRequest {
                    mark_closing: vec![MarkClosingForBucketRequest {
                        proto_session_id: "c1".into(),
                        bucket_id,
                    }],
                    ..Default::default()
                })
                .await;
        }

        let members = backend.get_all_protosessions_for_bucket(&[5, 7, 9]).await;
        assert_eq!(members[0], Ok(vec![]));
        assert_eq!(members[1], Ok(vec![]));
        assert_eq!(members[2], Ok(vec!["c1".to_string()]));
    }

    #[tokio::test]
    async fn test_cleanup_frees_identifiers() {
        let backend = backend();
        let claim = |client: &str| IdentifierConflictRequest {
            hit: hit("h", client, 0).with_identifier(SESSION_STAMP_IDENTIFIER, "X"),
            identifier_type: SESSION_STAMP_IDENTIFIER.into(),
        };
        backend.get_identifier_conflicts(&[claim("c1")]).await;

        let response = backend
            .cleanup(&CleanupRequest {
                remove_hits: vec![RemoveProtoSessionHitsRequest { proto_session_id: "c1".into() }],
                remove_metadata: vec![RemoveHitMetadataRequest { proto_session_id: "c1".into() }],
                remove_buckets: vec![RemoveBucketMetadataRequest { bucket_id: 1 }],
            })
            .await;
        assert!(response.first_error().is_none());

        let responses = backend.get_identifier_conflicts(&[claim("c2")]).await;
        assert_eq!(responses[0], Ok(IdentifierConflictResponse::none()));
    }
}
