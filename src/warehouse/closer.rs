use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::clickhouse::ClickhouseType;
use super::driver::{Row, WarehouseDriver};
use super::mapper::TypeMapper;
use super::sessions::{map_schema, session_rows, session_schema, Column};
use super::types::Value;
use crate::error::{FormatError, MappingError, TaskError};
use crate::hits::Hit;
use crate::protosessions::Closer;
use crate::ttlcache::TtlCache;

/// How long a written event id suppresses rewriting the same event
pub const WRITTEN_EVENTS_TTL: Duration = Duration::from_secs(600);

/// Writes closed sessions to a warehouse table, one row per hit
pub struct WarehouseCloser {
    driver: Arc<dyn WarehouseDriver>,
    table: String,
    columns: Vec<Column>,
    table_created: OnceCell<()>,
    written: TtlCache<String, ()>,
    processing_timeout: Duration,
}

impl WarehouseCloser {
    pub fn new(
        driver: Arc<dyn WarehouseDriver>,
        table: impl Into<String>,
        mapper: &Arc<dyn TypeMapper<ClickhouseType>>,
        processing_timeout: Duration,
    ) -> Result<Self, MappingError> {
        Ok(Self {
            driver,
            table: table.into(),
            columns: map_schema(mapper, &session_schema())?,
            table_created: OnceCell::new(),
            written: TtlCache::new(WRITTEN_EVENTS_TTL),
            processing_timeout,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn format_row(&self, mut raw: Row) -> Result<Row, FormatError> {
        let mut row = Row::new();
        for column in &self.columns {
            let value = raw.remove(&column.name).unwrap_or(Value::Null);
            let formatted = column
                .physical
                .format(&value, &column.logical.metadata)
                .map_err(|e| FormatError::Field {
                    field: column.name.clone(),
                    source: Box::new(e),
                })?;
            row.insert(column.name.clone(), formatted);
        }
        Ok(row)
    }

    fn event_id(row: &Row) -> Option<String> {
        match row.get("event_id") {
            Some(Value::String(id)) => Some(id.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl Closer for WarehouseCloser {
    async fn close(&self, sessions: &[Vec<Hit>]) -> Result<(), TaskError> {
        self.table_created
            .get_or_try_init(|| self.driver.create_table(&self.table, &self.columns))
            .await?;

        let mut rows = Vec::new();
        let mut event_ids = Vec::new();
        for raw in sessions.iter().flat_map(|session| session_rows(session)) {
            let event_id = Self::event_id(&raw);
            if let Some(id) = &event_id {
                if self.written.get(id).is_some() {
                    debug!(event_id = %id, "Skipping recently written event");
                    continue;
                }
            }
            match self.format_row(raw) {
                Ok(row) => {
                    rows.push(row);
                    event_ids.extend(event_id);
                }
                Err(e) => warn!(
                    table = %self.table,
                    event_id = event_id.as_deref().unwrap_or("-"),
                    "Dropping unformattable row: {}",
                    e
                ),
            }
        }

        if rows.is_empty() {
            return Ok(());
        }

        match tokio::time::timeout(self.processing_timeout, self.driver.write(&self.table, rows)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TaskError::retryable(format!(
                    "writing to {} timed out after {:?}",
                    self.table, self.processing_timeout
                )))
            }
        }

        for id in event_ids {
            self.written.set(id, ());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::clickhouse::clickhouse_mapper;
    use crate::warehouse::driver::testing::RecordingDriver;
    use chrono::{TimeZone, Utc};

    fn session() -> Vec<Hit> {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        vec![
            Hit::new("h1", "c1", start).with_param("page", "/home"),
            Hit::new("h2", "c1", start + chrono::Duration::seconds(5)),
        ]
    }

    fn closer(driver: Arc<RecordingDriver>, timeout: Duration) -> WarehouseCloser {
        WarehouseCloser::new(driver, "events", &clickhouse_mapper(), timeout).unwrap()
    }

    #[tokio::test]
    async fn test_writes_formatted_rows_and_creates_table_once() {
        let driver = Arc::new(RecordingDriver::default());
        let closer = closer(driver.clone(), Duration::from_secs(5));

        closer.close(&[session()]).await.unwrap();
        closer.close(&[session()]).await.unwrap();

        assert_eq!(*driver.tables.lock().await, vec!["events".to_string()]);
        let rows = driver.rows.lock().await;
        // the second close was recognised as a redelivery
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["timestamp"], Value::from("2024-05-01 10:00:00"));
        assert_eq!(rows[0]["date"], Value::from("2024-05-01"));
        assert_eq!(rows[0]["user_id"], Value::from(""));
    }

    #[tokio::test]
    async fn test_driver_failure_is_retried_in_full() {
        let driver = Arc::new(RecordingDriver {
            failures: tokio::sync::Mutex::new(vec![TaskError::retryable("warehouse down")]),
            ..Default::default()
        });
        let closer = closer(driver.clone(), Duration::from_secs(5));

        let err = closer.close(&[session()]).await.unwrap_err();
        assert!(!err.is_droppable());

        closer.close(&[session()]).await.unwrap();
        assert_eq!(driver.rows.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_write_times_out_as_retryable() {
        let driver = Arc::new(RecordingDriver {
            stall: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let closer = closer(driver, Duration::from_millis(20));

        let err = closer.close(&[session()]).await.unwrap_err();
        assert!(matches!(err, TaskError::Retryable(ref msg) if msg.contains("timed out")));
    }
}
