/// End-to-end session assembly: receiver storage -> filesystem queue -> worker -> closer
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use sessionizer::encoding::Codec;
use sessionizer::error::TaskError;
use sessionizer::hits::{identifier_types, Hit, HIT_PROCESSING_TASK_NAME, SESSION_STAMP_IDENTIFIER};
use sessionizer::pings::process_hits_ping_task;
use sessionizer::protosessions::{
    Closer, DeduplicatingBackend, HitsTaskHandler, Orchestrator, OrchestratorConfig, SqliteBatchedIoBackend,
    TimingWheel,
};
use sessionizer::queue::filesystem::FilesystemQueue;
use sessionizer::queue::worker::Worker;
use sessionizer::queue::{Consumer, Publisher};
use sessionizer::receiver::{PublishingStorage, Storage};
use sessionizer::storage::{database, SqliteKv};

#[derive(Default)]
struct CollectingCloser {
    sessions: Mutex<Vec<Vec<Hit>>>,
}

#[async_trait]
impl Closer for CollectingCloser {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<(), TaskError> {
        self.sessions.lock().await.extend_from_slice(sessions);
        Ok(())
    }
}

struct Pipeline {
    _dir: tempfile::TempDir,
    queue: Arc<FilesystemQueue>,
    ingress: PublishingStorage,
    worker: Worker,
    closer: Arc<CollectingCloser>,
}

async fn pipeline(session_timeout: Duration) -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(FilesystemQueue::new(dir.path().join("queue")).await.unwrap());
    let pool = database::connect("sqlite::memory:", 1).await.unwrap();

    let backend = SqliteBatchedIoBackend::new(pool.clone()).await.unwrap();
    let closer = Arc::new(CollectingCloser::default());
    let orchestrator = Orchestrator::new(
        Arc::new(DeduplicatingBackend::new(Arc::new(backend))),
        TimingWheel::new(Arc::new(SqliteKv::new(pool)), "sessions", Duration::from_millis(100)),
        closer.clone(),
        OrchestratorConfig {
            session_timeout,
            identifier_types: identifier_types(true, false),
        },
    );

    let worker = Worker::new().with_handler(
        HIT_PROCESSING_TASK_NAME,
        Arc::new(HitsTaskHandler::new(Arc::new(orchestrator), Codec::GzipJson)),
    );

    Pipeline {
        _dir: dir,
        ingress: PublishingStorage::new(queue.clone(), Codec::GzipJson),
        queue,
        worker,
        closer,
    }
}

fn start() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn stamped(id: &str, client: &str, stamp: &str, offset: ChronoDuration) -> Hit {
    Hit::new(id, client, start() + offset).with_identifier(SESSION_STAMP_IDENTIFIER, stamp)
}

#[tokio::test]
async fn test_session_stamp_joins_three_clients() {
    let p = pipeline(Duration::from_secs(2)).await;

    for (id, client, offset) in [("h1", "c1", 0), ("h2", "c2", 100), ("h3", "c3", 200)] {
        p.ingress
            .push(vec![stamped(id, client, "X", ChronoDuration::milliseconds(offset))])
            .await
            .unwrap();
    }
    p.queue
        .publish(&process_hits_ping_task(start() + ChronoDuration::milliseconds(2_500)))
        .await
        .unwrap();

    let processed = p.queue.consume_once(&p.worker).await.unwrap();
    assert_eq!(processed, 4);

    let sessions = p.closer.sessions.lock().await.clone();
    assert_eq!(sessions.len(), 1);

    let session = &sessions[0];
    let ids: Vec<&str> = session.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["h1", "h2", "h3"]);

    let authoritative = &session[0].authoritative_client_id;
    assert!(session.iter().all(|h| &h.authoritative_client_id == authoritative));
}

#[tokio::test]
async fn test_distinct_stamps_make_disjoint_sessions() {
    let p = pipeline(Duration::from_secs(30)).await;

    p.ingress
        .push(vec![stamped("h1", "c1", "A", ChronoDuration::zero())])
        .await
        .unwrap();
    p.ingress
        .push(vec![stamped("h2", "c1", "B", ChronoDuration::seconds(35))])
        .await
        .unwrap();
    p.queue
        .publish(&process_hits_ping_task(start() + ChronoDuration::seconds(90)))
        .await
        .unwrap();

    p.queue.consume_once(&p.worker).await.unwrap();

    let sessions = p.closer.sessions.lock().await.clone();
    assert_eq!(sessions.len(), 2);

    let mut stamps: Vec<&str> = sessions
        .iter()
        .map(|s| {
            assert_eq!(s.len(), 1);
            s[0].session_stamp()
        })
        .collect();
    stamps.sort();
    assert_eq!(stamps, vec!["A", "B"]);
}

#[tokio::test]
async fn test_session_stays_open_before_timeout() {
    let p = pipeline(Duration::from_secs(30)).await;

    p.ingress
        .push(vec![stamped("h1", "c1", "A", ChronoDuration::zero())])
        .await
        .unwrap();
    p.queue
        .publish(&process_hits_ping_task(start() + ChronoDuration::seconds(10)))
        .await
        .unwrap();
    p.queue.consume_once(&p.worker).await.unwrap();
    assert!(p.closer.sessions.lock().await.is_empty());

    p.queue
        .publish(&process_hits_ping_task(start() + ChronoDuration::seconds(31)))
        .await
        .unwrap();
    p.queue.consume_once(&p.worker).await.unwrap();
    assert_eq!(p.closer.sessions.lock().await.len(), 1);
}
