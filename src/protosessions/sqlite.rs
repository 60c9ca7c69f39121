//! Transactional proto-session backend on SQLite
//!
//! Four tables hold the state: identifier owners, hits per proto-session,
//! bucket membership and the latest bucket per proto-session. The latter
//! is mirrored in memory so bucket reads can drop stale members without a
//! join; the mirror only changes after a commit succeeded and is rebuilt
//! from the table on startup.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::batched::{
    fail_all, fill_unset, BatchRequest, BatchResponse, BatchedIoBackend, BucketId, CleanupRequest,
    CleanupResponse, IdentifierConflictRequest, IdentifierConflictResponse,
};
use crate::error::BackendError;
use crate::hits::Hit;

pub struct SqliteBatchedIoBackend {
    pool: SqlitePool,
    session_to_bucket: RwLock<HashMap<String, BucketId>>,
}

fn encode_bucket(bucket_id: BucketId) -> [u8; 8] {
    bucket_id.to_be_bytes()
}

fn decode_bucket(bytes: &[u8]) -> Result<BucketId, BackendError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| BackendError::Decode(format!("bucket id of {} bytes", bytes.len())))?;
    Ok(BucketId::from_be_bytes(array))
}

fn tx_error(err: sqlx::Error) -> BackendError {
    BackendError::Transaction(err.to_string())
}

impl SqliteBatchedIoBackend {
    /// Open the backend and rebuild the in-memory bucket mirror
    pub async fn new(pool: SqlitePool) -> Result<Self, BackendError> {
        let rows = sqlx::query("SELECT session_id, bucket_id FROM ps_session_to_bucket")
            .fetch_all(&pool)
            .await?;

        let mut mirror = HashMap::with_capacity(rows.len());
        for row in rows {
            let session_id: String = row.get("session_id");
            let bucket: Vec<u8> = row.get("bucket_id");
            mirror.insert(session_id, decode_bucket(&bucket)?);
        }
        info!(sessions = mirror.len(), "Loaded proto-session bucket map");

        Ok(Self {
            pool,
            session_to_bucket: RwLock::new(mirror),
        })
    }

    pub async fn latest_bucket(&self, proto_session_id: &str) -> Option<BucketId> {
        self.session_to_bucket.read().await.get(proto_session_id).copied()
    }
}

async fn claim_identifier(
    conn: &mut SqliteConnection,
    identifier_type: &str,
    value: &str,
    owner: &str,
) -> Result<IdentifierConflictResponse, BackendError> {
    sqlx::query("INSERT OR IGNORE INTO ps_identifiers (id_type, id_value, owner) VALUES (?, ?, ?)")
        .bind(identifier_type)
        .bind(value)
        .bind(owner)
        .execute(&mut *conn)
        .await?;

    let current: String = sqlx::query("SELECT owner FROM ps_identifiers WHERE id_type = ? AND id_value = ?")
        .bind(identifier_type)
        .bind(value)
        .fetch_one(&mut *conn)
        .await?
        .get("owner");

    Ok(if current == owner {
        IdentifierConflictResponse::none()
    } else {
        IdentifierConflictResponse::with_owner(current)
    })
}

async fn append_hits(conn: &mut SqliteConnection, proto_session_id: &str, hits: &[Hit]) -> Result<(), BackendError> {
    for hit in hits {
        let encoded = serde_json::to_vec(hit)?;
        // Redelivered hits keep their first copy
        sqlx::query("INSERT OR IGNORE INTO ps_hits (session_id, hit_id, hit) VALUES (?, ?, ?)")
            .bind(proto_session_id)
            .bind(&hit.id)
            .bind(encoded)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn get_hits(conn: &mut SqliteConnection, proto_session_id: &str) -> Result<Vec<Hit>, BackendError> {
    let rows = sqlx::query("SELECT hit FROM ps_hits WHERE session_id = ? ORDER BY rowid")
        .bind(proto_session_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| {
            let encoded: Vec<u8> = row.get("hit");
            serde_json::from_slice(&encoded).map_err(BackendError::from)
        })
        .collect()
}

async fn mark_closing(conn: &mut SqliteConnection, proto_session_id: &str, bucket_id: BucketId) -> Result<(), BackendError> {
    let bucket = encode_bucket(bucket_id);
    sqlx::query("INSERT OR IGNORE INTO ps_buckets (bucket_id, session_id) VALUES (?, ?)")
        .bind(&bucket[..])
        .bind(proto_session_id)
        .execute(&mut *conn)
        .await?;

    // Big-endian blobs compare like the numbers they encode
    sqlx::query(
        "INSERT INTO ps_session_to_bucket (session_id, bucket_id) VALUES (?, ?)
         ON CONFLICT(session_id) DO UPDATE SET bucket_id = excluded.bucket_id
         WHERE excluded.bucket_id > ps_session_to_bucket.bucket_id",
    )
    .bind(proto_session_id)
    .bind(&bucket[..])
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn bucket_members(conn: &mut SqliteConnection, bucket_id: BucketId) -> Result<Vec<String>, BackendError> {
    let bucket = encode_bucket(bucket_id);
    let rows = sqlx::query("SELECT session_id FROM ps_buckets WHERE bucket_id = ? ORDER BY session_id")
        .bind(&bucket[..])
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("session_id")).collect())
}

#[async_trait]
impl BatchedIoBackend for SqliteBatchedIoBackend {
    async fn get_identifier_conflicts(
        &self,
        requests: &[IdentifierConflictRequest],
    ) -> Vec<Result<IdentifierConflictResponse, BackendError>> {
        let mut slots: Vec<Option<Result<IdentifierConflictResponse, BackendError>>> = vec![None; requests.len()];

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => return fill_unset(slots, &tx_error(e)),
        };

        for (slot, request) in slots.iter_mut().zip(requests) {
            let Some(value) = request.hit.identifier(&request.identifier_type) else {
                *slot = Some(Ok(IdentifierConflictResponse::none()));
                continue;
            };
            *slot = Some(
                claim_identifier(
                    &mut tx,
                    &request.identifier_type,
                    value,
                    &request.hit.authoritative_client_id,
                )
                .await,
            );
        }

        if let Err(e) = tx.commit().await {
            warn!("Identifier transaction failed to commit: {}", e);
            return fail_all(slots, &tx_error(e));
        }
        fill_unset(slots, &BackendError::Transaction("unanswered request".into()))
    }

    async fn handle_batch(&self, request: &BatchRequest) -> BatchResponse {
        let mut append: Vec<Option<Result<(), BackendError>>> = vec![None; request.append_hits.len()];
        let mut get: Vec<Option<Result<Vec<Hit>, BackendError>>> = vec![None; request.get_hits.len()];
        let mut mark: Vec<Option<Result<(), BackendError>>> = vec![None; request.mark_closing.len()];
        let mut pending_marks = Vec::new();

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => return BatchResponse::failed(request, &tx_error(e)),
        };

        for (slot, req) in append.iter_mut().zip(&request.append_hits) {
            *slot = Some(append_hits(&mut tx, &req.proto_session_id, &req.hits).await);
        }
        for (slot, req) in get.iter_mut().zip(&request.get_hits) {
            *slot = Some(get_hits(&mut tx, &req.proto_session_id).await);
        }
        for (slot, req) in mark.iter_mut().zip(&request.mark_closing) {
            let result = mark_closing(&mut tx, &req.proto_session_id, req.bucket_id).await;
            if result.is_ok() {
                pending_marks.push((req.proto_session_id.clone(), req.bucket_id));
            }
            *slot = Some(result);
        }

        if let Err(e) = tx.commit().await {
            warn!("Proto-session batch failed to commit: {}", e);
            let err = tx_error(e);
            return BatchResponse {
                append_hits: fail_all(append, &err),
                get_hits: fail_all(get, &err),
                mark_closing: fail_all(mark, &err),
            };
        }

        if !pending_marks.is_empty() {
            let mut mirror = self.session_to_bucket.write().await;
            for (session, bucket) in pending_marks {
                let latest = mirror.entry(session).or_insert(bucket);
                *latest = (*latest).max(bucket);
            }
        }

        let unanswered = BackendError::Transaction("unanswered request".into());
        BatchResponse {
            append_hits: fill_unset(append, &unanswered),
            get_hits: fill_unset(get, &unanswered),
            mark_closing: fill_unset(mark, &unanswered),
        }
    }

    async fn get_all_protosessions_for_bucket(
        &self,
        bucket_ids: &[BucketId],
    ) -> Vec<Result<Vec<String>, BackendError>> {
        let snapshot = self.session_to_bucket.read().await.clone();
        let mut slots: Vec<Option<Result<Vec<String>, BackendError>>> = vec![None; bucket_ids.len()];

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => return fill_unset(slots, &tx_error(e)),
        };

        for (slot, &bucket_id) in slots.iter_mut().zip(bucket_ids) {
            let result = bucket_members(&mut tx, bucket_id).await.map(|members| {
                let total = members.len();
                let latest: Vec<String> = members
                    .into_iter()
                    .filter(|session| snapshot.get(session) == Some(&bucket_id))
                    .collect();
                if latest.len() < total {
                    debug!(bucket_id, stale = total - latest.len(), "Skipping rescheduled proto-sessions");
                }
                latest
            });
            *slot = Some(result);
        }

        if let Err(e) = tx.commit().await {
            return fail_all(slots, &tx_error(e));
        }
        fill_unset(slots, &BackendError::Transaction("unanswered request".into()))
    }

    async fn cleanup(&self, request: &CleanupRequest) -> CleanupResponse {
        let mut hits: Vec<Option<Result<(), BackendError>>> = vec![None; request.remove_hits.len()];
        let mut metadata: Vec<Option<Result<(), BackendError>>> = vec![None; request.remove_metadata.len()];
        let mut buckets: Vec<Option<Result<(), BackendError>>> = vec![None; request.remove_buckets.len()];
        let mut forgotten = Vec::new();

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => return CleanupResponse::failed(request, &tx_error(e)),
        };

        for (slot, req) in hits.iter_mut().zip(&request.remove_hits) {
            let result = sqlx::query("DELETE FROM ps_hits WHERE session_id = ?")
                .bind(&req.proto_session_id)
                .execute(&mut *tx)
                .await
                .map(|_| ())
                .map_err(BackendError::from);
            *slot = Some(result);
        }

        for (slot, req) in metadata.iter_mut().zip(&request.remove_metadata) {
            let result = async {
                sqlx::query("DELETE FROM ps_identifiers WHERE owner = ?")
                    .bind(&req.proto_session_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM ps_session_to_bucket WHERE session_id = ?")
                    .bind(&req.proto_session_id)
                    .execute(&mut *tx)
                    .await?;
                Ok::<_, BackendError>(())
            }
            .await;
            if result.is_ok() {
                forgotten.push(req.proto_session_id.clone());
            }
            *slot = Some(result);
        }

        for (slot, req) in buckets.iter_mut().zip(&request.remove_buckets) {
            let bucket = encode_bucket(req.bucket_id);
            let result = sqlx::query("DELETE FROM ps_buckets WHERE bucket_id = ?")
                .bind(&bucket[..])
                .execute(&mut *tx)
                .await
                .map(|_| ())
                .map_err(BackendError::from);
            *slot = Some(result);
        }

        if let Err(e) = tx.commit().await {
            warn!("Proto-session cleanup failed to commit: {}", e);
            let err = tx_error(e);
            return CleanupResponse {
                remove_hits: fail_all(hits, &err),
                remove_metadata: fail_all(metadata, &err),
                remove_buckets: fail_all(buckets, &err),
            };
        }

        if !forgotten.is_empty() {
            let mut mirror = self.session_to_bucket.write().await;
            for session in &forgotten {
                mirror.remove(session);
            }
        }

        let unanswered = BackendError::Transaction("unanswered request".into());
        CleanupResponse {
            remove_hits: fill_unset(hits, &unanswered),
            remove_metadata: fill_unset(metadata, &unanswered),
            remove_buckets: fill_unset(buckets, &unanswered),
        }
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.pool.close().await;
        Ok(())
    }
}
