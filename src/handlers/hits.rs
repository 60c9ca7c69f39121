use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::error::TaskError;
use crate::hits::Hit;
use crate::receiver::Storage;

/// Handle POST /hits
///
/// Accepts a JSON array of already-parsed hits and hands it to the
/// receiver storage.
pub async fn ingest_hits(
    State(storage): State<Arc<dyn Storage>>,
    Json(hits): Json<Vec<Hit>>,
) -> Result<impl IntoResponse, TaskError> {
    let accepted = hits.len();
    debug!(accepted, "Ingesting hits");
    storage.push(hits).await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        hits: Mutex<Vec<Hit>>,
        fail: bool,
    }

    #[async_trait]
    impl Storage for Recorder {
        async fn push(&self, hits: Vec<Hit>) -> Result<(), TaskError> {
            if self.fail {
                return Err(TaskError::retryable("queue unavailable"));
            }
            self.hits.lock().await.extend(hits);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ingest_pushes_hits() {
        let recorder = Arc::new(Recorder::default());
        let hits = vec![Hit::new("h1", "c1", Utc::now()), Hit::new("h2", "c1", Utc::now())];

        let response = ingest_hits(State(recorder.clone() as Arc<dyn Storage>), Json(hits))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(recorder.hits.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_failure_is_unavailable() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });

        let response = ingest_hits(State(recorder as Arc<dyn Storage>), Json(vec![]))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
