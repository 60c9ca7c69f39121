use async_trait::async_trait;
use tracing::info;

use crate::error::TaskError;
use crate::hits::Hit;

/// Receives finished sessions, each a non-empty list of hits sorted by
/// `server_received_time`.
///
/// Sessions may be delivered again after a failure, so implementations
/// must tolerate duplicates.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<(), TaskError>;
}

/// Logs a summary of every closed session
#[derive(Debug, Default)]
pub struct LoggingCloser;

#[async_trait]
impl Closer for LoggingCloser {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<(), TaskError> {
        for session in sessions {
            let (Some(first), Some(last)) = (session.first(), session.last()) else {
                continue;
            };
            info!(
                client_id = %first.authoritative_client_id,
                hits = session.len(),
                started = %first.server_received_time,
                ended = %last.server_received_time,
                "Session closed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Records closed sessions, optionally failing the first calls
    #[derive(Default)]
    pub struct RecordingCloser {
        pub sessions: Mutex<Vec<Vec<Hit>>>,
        pub failures: Mutex<Vec<TaskError>>,
    }

    impl RecordingCloser {
        pub fn failing_with(errors: Vec<TaskError>) -> Self {
            Self {
                sessions: Mutex::new(Vec::new()),
                failures: Mutex::new(errors),
            }
        }

        pub async fn closed(&self) -> Vec<Vec<Hit>> {
            self.sessions.lock().await.clone()
        }
    }

    #[async_trait]
    impl Closer for RecordingCloser {
        async fn close(&self, sessions: &[Vec<Hit>]) -> Result<(), TaskError> {
            if let Some(err) = self.failures.lock().await.pop() {
                return Err(err);
            }
            self.sessions.lock().await.extend_from_slice(sessions);
            Ok(())
        }
    }
}
