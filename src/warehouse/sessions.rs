//! Session-scoped event table
//!
//! One row per hit, carrying the position of the hit inside its session.

use std::sync::Arc;

use super::clickhouse::ClickhouseType;
use super::driver::Row;
use super::mapper::TypeMapper;
use super::types::{DataType, Field, LogicalType, Value};
use crate::error::MappingError;
use crate::hits::Hit;

/// A logical column together with its physical artifact
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub logical: LogicalType,
    pub physical: ClickhouseType,
}

impl Column {
    pub fn definition(&self) -> String {
        self.physical.column_definition(&self.name)
    }
}

pub fn session_schema() -> Vec<Field> {
    vec![
        Field::new("event_id", DataType::String, false),
        Field::new("session_id", DataType::String, false),
        Field::new("client_id", DataType::String, false),
        Field::new("user_id", DataType::String, true),
        Field::new("property_id", DataType::String, false),
        Field::new("ip", DataType::String, false),
        Field::new("timestamp", DataType::TimestampSeconds, false),
        Field::new("date", DataType::Date32, false),
        Field::new("session_hit_number", DataType::Int32, false),
        Field::new("session_total_hits", DataType::Int32, false),
        Field::new("session_duration", DataType::Int64, false),
        Field::new(
            "params",
            DataType::list_of(DataType::Struct(vec![
                Field::new("key", DataType::String, false),
                Field::new("value", DataType::String, true),
            ])),
            false,
        ),
    ]
}

/// Map every field of a schema, failing on the first unsupported one
pub fn map_schema(
    mapper: &Arc<dyn TypeMapper<ClickhouseType>>,
    fields: &[Field],
) -> Result<Vec<Column>, MappingError> {
    fields
        .iter()
        .map(|field| {
            let logical = LogicalType::from(field);
            Ok(Column {
                name: field.name.clone(),
                physical: mapper.logical_to_physical(&logical)?,
                logical,
            })
        })
        .collect()
}

fn param_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

fn clamp_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Unformatted rows for one session, hits assumed sorted by time.
///
/// The session id is the id of the first hit so redelivered sessions
/// produce identical rows.
pub fn session_rows(session: &[Hit]) -> Vec<Row> {
    let (Some(first), Some(last)) = (session.first(), session.last()) else {
        return Vec::new();
    };
    let duration = (last.server_received_time - first.server_received_time).num_seconds();
    let total = clamp_i32(session.len());

    session
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            let params = hit
                .payload
                .iter()
                .map(|(key, value)| {
                    let mut param = Row::new();
                    param.insert("key".to_string(), Value::from(key.as_str()));
                    param.insert("value".to_string(), param_value(value));
                    Value::Map(param)
                })
                .collect();

            let mut row = Row::new();
            row.insert("event_id".into(), Value::from(hit.id.as_str()));
            row.insert("session_id".into(), Value::from(first.id.as_str()));
            row.insert("client_id".into(), Value::from(hit.authoritative_client_id.as_str()));
            row.insert("user_id".into(), Value::from(hit.user_id.clone()));
            row.insert("property_id".into(), Value::from(hit.property_id.as_str()));
            row.insert("ip".into(), Value::from(hit.ip.as_str()));
            row.insert("timestamp".into(), Value::Time(hit.server_received_time));
            row.insert("date".into(), Value::Time(hit.server_received_time));
            row.insert("session_hit_number".into(), Value::Int32(clamp_i32(i + 1)));
            row.insert("session_total_hits".into(), Value::Int32(total));
            row.insert("session_duration".into(), Value::Int64(duration));
            row.insert("params".into(), Value::List(params));
            row
        })
        .collect()
}
