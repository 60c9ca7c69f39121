use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::sessions::Column;
use super::types::Value;
use crate::error::TaskError;

/// Column name to formatted value
pub type Row = BTreeMap<String, Value>;

/// Destination table writer
///
/// Both calls may be repeated after a failure; the table is keyed by
/// `event_id` so rewritten rows replace earlier copies.
#[async_trait]
pub trait WarehouseDriver: Send + Sync {
    async fn create_table(&self, table: &str, columns: &[Column]) -> Result<(), TaskError>;

    async fn write(&self, table: &str, rows: Vec<Row>) -> Result<(), TaskError>;
}

/// DDL for a deduplicating table ordered by its first column
pub fn create_table_statement(table: &str, columns: &[Column]) -> String {
    let definitions: Vec<String> = columns.iter().map(|c| format!("    {}", c.definition())).collect();
    let order_by = columns.first().map(|c| c.name.as_str()).unwrap_or("tuple()");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n) ENGINE = ReplacingMergeTree ORDER BY {}",
        table,
        definitions.join(",\n"),
        order_by
    )
}

/// Logs what it would write
#[derive(Debug, Default)]
pub struct LoggingDriver;

#[async_trait]
impl WarehouseDriver for LoggingDriver {
    async fn create_table(&self, table: &str, columns: &[Column]) -> Result<(), TaskError> {
        info!(table = %table, columns = columns.len(), "Creating table");
        debug!("{}", create_table_statement(table, columns));
        Ok(())
    }

    async fn write(&self, table: &str, rows: Vec<Row>) -> Result<(), TaskError> {
        info!(table = %table, rows = rows.len(), "Writing rows");
        for row in &rows {
            match serde_json::to_string(row) {
                Ok(line) => debug!(table = %table, "{}", line),
                Err(e) => debug!(table = %table, "Unprintable row: {}", e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Keeps everything written, optionally failing or stalling writes
    #[derive(Default)]
    pub struct RecordingDriver {
        pub tables: Mutex<Vec<String>>,
        pub rows: Mutex<Vec<Row>>,
        pub failures: Mutex<Vec<TaskError>>,
        pub stall: Option<std::time::Duration>,
    }

    #[async_trait]
    impl WarehouseDriver for RecordingDriver {
        async fn create_table(&self, table: &str, _columns: &[Column]) -> Result<(), TaskError> {
            self.tables.lock().await.push(table.to_string());
            Ok(())
        }

        async fn write(&self, _table: &str, rows: Vec<Row>) -> Result<(), TaskError> {
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if let Some(err) = self.failures.lock().await.pop() {
                return Err(err);
            }
            self.rows.lock().await.extend(rows);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::clickhouse::clickhouse_mapper;
    use crate::warehouse::sessions::{map_schema, session_schema};

    #[test]
    fn test_create_table_statement() {
        let columns = map_schema(&clickhouse_mapper(), &session_schema()).unwrap();
        let ddl = create_table_statement("events", &columns);

        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS events (\n    event_id String,\n"));
        assert!(ddl.contains("    user_id String DEFAULT '',\n"));
        assert!(ddl.ends_with(") ENGINE = ReplacingMergeTree ORDER BY event_id"));
    }
}
