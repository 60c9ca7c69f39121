//! Batched I/O contract of the proto-session state
//!
//! Every operation takes a slice of requests and answers with a vector of
//! the same length. A failing request only fails its own position; a
//! failed transaction fails every position it left unanswered.

use async_trait::async_trait;

use crate::error::BackendError;
use crate::hits::Hit;

pub type BucketId = u64;

/// Claim `(identifier_type, hit.identifier(type))` for the hit's
/// authoritative client id, or report the current owner
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierConflictRequest {
    pub hit: Hit,
    pub identifier_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentifierConflictResponse {
    pub has_conflict: bool,
    /// Owner of the identifier when `has_conflict` is set
    pub conflicts_with: String,
}

impl IdentifierConflictResponse {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_owner(owner: impl Into<String>) -> Self {
        Self {
            has_conflict: true,
            conflicts_with: owner.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendHitsRequest {
    pub proto_session_id: String,
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetProtoSessionHitsRequest {
    pub proto_session_id: String,
}

/// Schedule a proto-session into a bucket. The latest (highest) bucket wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkClosingForBucketRequest {
    pub proto_session_id: String,
    pub bucket_id: BucketId,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchRequest {
    pub append_hits: Vec<AppendHitsRequest>,
    pub get_hits: Vec<GetProtoSessionHitsRequest>,
    pub mark_closing: Vec<MarkClosingForBucketRequest>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchResponse {
    pub append_hits: Vec<Result<(), BackendError>>,
    pub get_hits: Vec<Result<Vec<Hit>, BackendError>>,
    pub mark_closing: Vec<Result<(), BackendError>>,
}

impl BatchResponse {
    /// Every position failed with the same error
    pub fn failed(request: &BatchRequest, err: &BackendError) -> Self {
        Self {
            append_hits: vec![Err(err.clone()); request.append_hits.len()],
            get_hits: vec![Err(err.clone()); request.get_hits.len()],
            mark_closing: vec![Err(err.clone()); request.mark_closing.len()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveProtoSessionHitsRequest {
    pub proto_session_id: String,
}

/// Release identifiers owned by the proto-session and forget its bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveHitMetadataRequest {
    pub proto_session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveBucketMetadataRequest {
    pub bucket_id: BucketId,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CleanupRequest {
    pub remove_hits: Vec<RemoveProtoSessionHitsRequest>,
    pub remove_metadata: Vec<RemoveHitMetadataRequest>,
    pub remove_buckets: Vec<RemoveBucketMetadataRequest>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CleanupResponse {
    pub remove_hits: Vec<Result<(), BackendError>>,
    pub remove_metadata: Vec<Result<(), BackendError>>,
    pub remove_buckets: Vec<Result<(), BackendError>>,
}

impl CleanupResponse {
    pub fn failed(request: &CleanupRequest, err: &BackendError) -> Self {
        Self {
            remove_hits: vec![Err(err.clone()); request.remove_hits.len()],
            remove_metadata: vec![Err(err.clone()); request.remove_metadata.len()],
            remove_buckets: vec![Err(err.clone()); request.remove_buckets.len()],
        }
    }

    /// First error among all positions
    pub fn first_error(&self) -> Option<&BackendError> {
        self.remove_hits
            .iter()
            .chain(&self.remove_metadata)
            .chain(&self.remove_buckets)
            .find_map(|r| r.as_ref().err())
    }
}

#[async_trait]
pub trait BatchedIoBackend: Send + Sync {
    async fn get_identifier_conflicts(
        &self,
        requests: &[IdentifierConflictRequest],
    ) -> Vec<Result<IdentifierConflictResponse, BackendError>>;

    /// Append, read and mark in one transaction
    async fn handle_batch(&self, request: &BatchRequest) -> BatchResponse;

    /// Sessions whose latest bucket is still the requested one
    async fn get_all_protosessions_for_bucket(
        &self,
        bucket_ids: &[BucketId],
    ) -> Vec<Result<Vec<String>, BackendError>>;

    async fn cleanup(&self, request: &CleanupRequest) -> CleanupResponse;

    async fn stop(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Fill every unanswered position with the transaction error
pub(crate) fn fill_unset<T>(slots: Vec<Option<Result<T, BackendError>>>, err: &BackendError) -> Vec<Result<T, BackendError>> {
    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(err.clone())))
        .collect()
}

/// Turn all positions into errors after a failed commit
pub(crate) fn fail_all<T>(slots: Vec<Option<Result<T, BackendError>>>, err: &BackendError) -> Vec<Result<T, BackendError>> {
    slots.into_iter().map(|_| Err(err.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_unset_keeps_answered_positions() {
        let err = BackendError::Transaction("busy".into());
        let slots = vec![Some(Ok(1)), None, Some(Err(BackendError::Decode("x".into())))];

        let filled = fill_unset(slots, &err);
        assert_eq!(filled[0], Ok(1));
        assert_eq!(filled[1], Err(err.clone()));
        assert_eq!(filled[2], Err(BackendError::Decode("x".into())));
    }

    #[test]
    fn test_cleanup_first_error() {
        let mut response = CleanupResponse {
            remove_hits: vec![Ok(())],
            remove_metadata: vec![Ok(())],
            remove_buckets: vec![Ok(())],
        };
        assert!(response.first_error().is_none());

        response.remove_buckets[0] = Err(BackendError::Storage("io".into()));
        assert_eq!(response.first_error(), Some(&BackendError::Storage("io".into())));
    }
}
