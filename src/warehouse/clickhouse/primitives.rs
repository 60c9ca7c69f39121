use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::Arc;

use super::parser::parse_type;
use super::{ClickhouseType, CLICKHOUSE_MAPPER_NAME};
use crate::error::{FormatError, MappingError};
use crate::warehouse::mapper::TypeMapper;
use crate::warehouse::types::{DataType, LogicalType, Metadata, Value};

type ValueFormat = fn(&Value) -> Result<Value, FormatError>;

/// One scalar column type
struct Primitive {
    data_type: DataType,
    type_name: &'static str,
    /// Names accepted in the reverse direction, DDL and introspection casing
    aliases: &'static [&'static str],
    default_value: fn() -> Value,
    default_sql: &'static str,
    format: ValueFormat,
}

pub(super) struct PrimitiveMapper {
    primitive: Primitive,
}

pub(super) fn primitive_mappers() -> Vec<Arc<dyn TypeMapper<ClickhouseType>>> {
    let epoch = || Value::Time(DateTime::<Utc>::UNIX_EPOCH);
    let table = vec![
        Primitive {
            data_type: DataType::String,
            type_name: "String",
            aliases: &["String", "string", "utf8"],
            default_value: || Value::String(String::new()),
            default_sql: "''",
            format: format_string,
        },
        Primitive {
            data_type: DataType::Int64,
            type_name: "Int64",
            aliases: &["Int64", "int64"],
            default_value: || Value::Int64(0),
            default_sql: "0",
            format: format_int64,
        },
        Primitive {
            data_type: DataType::Int32,
            type_name: "Int32",
            aliases: &["Int32", "int32"],
            default_value: || Value::Int32(0),
            default_sql: "0",
            format: format_int32,
        },
        Primitive {
            data_type: DataType::Float64,
            type_name: "Float64",
            aliases: &["Float64", "float64"],
            default_value: || Value::Float64(0.0),
            default_sql: "0",
            format: format_float64,
        },
        Primitive {
            data_type: DataType::Float32,
            type_name: "Float32",
            aliases: &["Float32", "float32"],
            default_value: || Value::Float32(0.0),
            default_sql: "0",
            format: format_float32,
        },
        Primitive {
            data_type: DataType::TimestampSeconds,
            type_name: "DateTime64(0)",
            aliases: &[],
            default_value: epoch,
            default_sql: "'1970-01-01 00:00:00'",
            format: format_timestamp,
        },
        Primitive {
            data_type: DataType::Boolean,
            type_name: "Bool",
            aliases: &["Bool", "bool"],
            default_value: || Value::Bool(false),
            default_sql: "0",
            format: format_bool,
        },
        Primitive {
            data_type: DataType::Date32,
            type_name: "Date32",
            aliases: &["Date32", "date32"],
            default_value: epoch,
            default_sql: "'1970-01-01'",
            format: format_date,
        },
    ];

    table
        .into_iter()
        .map(|primitive| Arc::new(PrimitiveMapper { primitive }) as Arc<dyn TypeMapper<ClickhouseType>>)
        .collect()
}

impl PrimitiveMapper {
    fn matches_physical(&self, type_name: &str) -> bool {
        let Ok(expr) = parse_type(type_name) else {
            return false;
        };
        if self.primitive.data_type == DataType::TimestampSeconds {
            // only second precision maps back
            return expr.name == "DateTime64" && expr.single_arg().is_some_and(|a| a.name == "0" && a.args.is_empty());
        }
        expr.args.is_empty() && self.primitive.aliases.contains(&expr.name.as_str())
    }
}

impl TypeMapper<ClickhouseType> for PrimitiveMapper {
    fn logical_to_physical(&self, logical: &LogicalType) -> Result<ClickhouseType, MappingError> {
        if logical.data_type != self.primitive.data_type {
            return Err(MappingError::unsupported_logical(
                CLICKHOUSE_MAPPER_NAME,
                logical.data_type.to_string(),
            ));
        }

        let format = self.primitive.format;
        Ok(
            ClickhouseType::new(self.primitive.type_name, Arc::new(move |value: &Value, _: &Metadata| format(value)))
                .with_default((self.primitive.default_value)(), self.primitive.default_sql),
        )
    }

    fn physical_to_logical(&self, physical: &ClickhouseType) -> Result<LogicalType, MappingError> {
        if self.matches_physical(&physical.type_name) {
            Ok(LogicalType::new(self.primitive.data_type.clone()))
        } else {
            Err(MappingError::unsupported_physical(
                CLICKHOUSE_MAPPER_NAME,
                physical.type_name.clone(),
            ))
        }
    }
}

fn mismatch(expected: &'static str, got: &Value) -> FormatError {
    FormatError::TypeMismatch {
        expected,
        got: got.kind().to_string(),
    }
}

fn format_string(value: &Value) -> Result<Value, FormatError> {
    match value {
        Value::String(_) => Ok(value.clone()),
        other => Err(mismatch("string", other)),
    }
}

fn format_int64(value: &Value) -> Result<Value, FormatError> {
    match value {
        Value::Int32(v) => Ok(Value::Int64(i64::from(*v))),
        Value::Int64(_) => Ok(value.clone()),
        other => Err(mismatch("int64-compatible value", other)),
    }
}

fn format_int32(value: &Value) -> Result<Value, FormatError> {
    match value {
        Value::Int32(_) => Ok(value.clone()),
        Value::Int64(v) => i32::try_from(*v).map(Value::Int32).map_err(|_| FormatError::Overflow {
            value: v.to_string(),
            target: "Int32",
        }),
        other => Err(mismatch("int32-compatible value", other)),
    }
}

fn format_float64(value: &Value) -> Result<Value, FormatError> {
    match value {
        Value::Float32(v) => Ok(Value::Float64(f64::from(*v))),
        Value::Float64(_) => Ok(value.clone()),
        other => Err(mismatch("float64-compatible value", other)),
    }
}

fn format_float32(value: &Value) -> Result<Value, FormatError> {
    match value {
        Value::Float32(_) => Ok(value.clone()),
        Value::Float64(v) => {
            if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                return Err(FormatError::Overflow {
                    value: v.to_string(),
                    target: "Float32",
                });
            }
            Ok(Value::Float32(*v as f32))
        }
        other => Err(mismatch("float32-compatible value", other)),
    }
}

fn format_bool(value: &Value) -> Result<Value, FormatError> {
    match value {
        Value::Bool(_) => Ok(value.clone()),
        other => Err(mismatch("bool", other)),
    }
}

fn format_date(value: &Value) -> Result<Value, FormatError> {
    match value {
        Value::Time(t) => Ok(Value::String(t.format("%Y-%m-%d").to_string())),
        Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(|_| value.clone())
            .map_err(|_| FormatError::InvalidDate(s.clone())),
        other => Err(mismatch("time or date string", other)),
    }
}

fn format_timestamp(value: &Value) -> Result<Value, FormatError> {
    let time = match value {
        Value::Int64(nanos) => Utc.timestamp_nanos(*nanos),
        Value::Int32(nanos) => Utc.timestamp_nanos(i64::from(*nanos)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| FormatError::InvalidTimestamp(s.clone()))?,
        Value::Time(t) => *t,
        other => return Err(mismatch("int32, int64, ISO string or time", other)),
    };
    Ok(Value::String(clickhouse_timestamp(&time)))
}

/// `YYYY-MM-DD HH:MM:SS` with the fraction appended only when non-zero
fn clickhouse_timestamp(time: &DateTime<Utc>) -> String {
    let mut out = time.format("%Y-%m-%d %H:%M:%S").to_string();
    let nanos = time.timestamp_subsec_nanos();
    if nanos > 0 {
        let fraction = format!("{:09}", nanos);
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_inputs() {
        let expected = Value::from("2024-03-01 12:30:05");
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();

        assert_eq!(format_timestamp(&Value::Time(time)).unwrap(), expected);
        assert_eq!(
            format_timestamp(&Value::Int64(time.timestamp_nanos_opt().unwrap())).unwrap(),
            expected
        );
        assert_eq!(format_timestamp(&Value::from("2024-03-01T12:30:05Z")).unwrap(), expected);
        assert_eq!(
            format_timestamp(&Value::from("2024-03-01T12:30:05.250+00:00")).unwrap(),
            Value::from("2024-03-01 12:30:05.25")
        );
        assert!(matches!(
            format_timestamp(&Value::from("yesterday")),
            Err(FormatError::InvalidTimestamp(_))
        ));
        assert!(matches!(format_timestamp(&Value::Bool(true)), Err(FormatError::TypeMismatch { .. })));
    }

    #[test]
    fn test_date_validation() {
        assert_eq!(format_date(&Value::from("2024-02-29")).unwrap(), Value::from("2024-02-29"));
        assert!(matches!(format_date(&Value::from("2023-02-29")), Err(FormatError::InvalidDate(_))));
        assert!(matches!(format_date(&Value::Int32(1)), Err(FormatError::TypeMismatch { .. })));
    }

    #[test]
    fn test_widening_and_narrowing() {
        assert_eq!(format_int64(&Value::Int32(5)).unwrap(), Value::Int64(5));
        assert_eq!(format_float64(&Value::Float32(1.5)).unwrap(), Value::Float64(1.5));
        assert_eq!(format_float32(&Value::Float64(1.5)).unwrap(), Value::Float32(1.5));
        assert!(matches!(
            format_float32(&Value::Float64(1e300)),
            Err(FormatError::Overflow { target: "Float32", .. })
        ));
        assert!(format_int64(&Value::from("5")).is_err());
        assert!(format_bool(&Value::Int32(1)).is_err());
    }
}
