//! ClickHouse flavour of the type mapper
//!
//! Nullable scalars become NOT NULL columns with a `DEFAULT`, lists become
//! `Array(T)`, and lists of flat structs become `Nested(...)`.
//!
//! # Example
//!
//! ```ignore
//! let mapper = clickhouse_mapper();
//! let ty = mapper.logical_to_physical(&LogicalType::nullable(DataType::Int64))?;
//! assert_eq!(ty.column_definition("n"), "n Int64 DEFAULT 0");
//! ```

mod complex;
pub mod parser;
mod primitives;

use std::fmt;
use std::sync::{Arc, Weak};

use super::mapper::{CompositeMapper, DeferredMapper, TypeMapper};
use super::types::{Metadata, Value};
use crate::error::FormatError;

pub use parser::{parse_type, TypeArg, TypeExpr};

pub const CLICKHOUSE_MAPPER_NAME: &str = "clickhouse";

/// Column modifier marking a nullable logical column stored as NOT NULL
pub const DEFAULT_MODIFIER: &str = "DEFAULT";

pub type FormatFn = Arc<dyn Fn(&Value, &Metadata) -> Result<Value, FormatError> + Send + Sync>;

/// Physical column type plus the formatter values go through before insertion
#[derive(Clone)]
pub struct ClickhouseType {
    pub type_name: String,
    /// Empty, or [`DEFAULT_MODIFIER`]
    pub column_modifiers: String,
    pub default_value: Option<Value>,
    pub default_sql_expression: String,
    formatter: FormatFn,
}

impl ClickhouseType {
    pub(crate) fn new(type_name: impl Into<String>, formatter: FormatFn) -> Self {
        Self {
            type_name: type_name.into(),
            column_modifiers: String::new(),
            default_value: None,
            default_sql_expression: String::new(),
            formatter,
        }
    }

    /// A bare type as read back from a table, for the reverse direction.
    /// Its formatter rejects every value.
    pub fn physical(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let name = type_name.clone();
        Self::new(
            type_name,
            Arc::new(move |value: &Value, _: &Metadata| {
                Err(FormatError::TypeMismatch {
                    expected: "a mapped column type",
                    got: format!("{} for unmapped type {}", value.kind(), name),
                })
            }),
        )
    }

    pub fn with_modifiers(mut self, modifiers: impl Into<String>) -> Self {
        self.column_modifiers = modifiers.into();
        self
    }

    pub(crate) fn with_default(mut self, value: Value, sql_expression: impl Into<String>) -> Self {
        self.default_value = Some(value);
        self.default_sql_expression = sql_expression.into();
        self
    }

    pub fn format(&self, value: &Value, metadata: &Metadata) -> Result<Value, FormatError> {
        (self.formatter)(value, metadata)
    }

    pub fn has_default_modifier(&self) -> bool {
        self.column_modifiers == DEFAULT_MODIFIER
    }

    /// Column clause for `CREATE TABLE`
    pub fn column_definition(&self, column: &str) -> String {
        if self.has_default_modifier() {
            format!(
                "{} {} {} {}",
                column, self.type_name, self.column_modifiers, self.default_sql_expression
            )
        } else {
            format!("{} {}", column, self.type_name)
        }
    }
}

impl fmt::Debug for ClickhouseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickhouseType")
            .field("type_name", &self.type_name)
            .field("column_modifiers", &self.column_modifiers)
            .field("default_value", &self.default_value)
            .field("default_sql_expression", &self.default_sql_expression)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ClickhouseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name)
    }
}

/// Build the full ClickHouse mapper graph.
///
/// Order is significant: nullability-as-default must precede the nullable
/// wrapper so nullable scalars get the DEFAULT shape.
pub fn clickhouse_mapper() -> Arc<dyn TypeMapper<ClickhouseType>> {
    let composite = Arc::new_cyclic(|weak: &Weak<CompositeMapper<ClickhouseType>>| {
        let weak = weak.clone();
        let deferred: Arc<dyn TypeMapper<ClickhouseType>> = Arc::new(DeferredMapper::new(move || {
            weak.upgrade().map(|m| m as Arc<dyn TypeMapper<ClickhouseType>>)
        }));

        let mut mappers: Vec<Arc<dyn TypeMapper<ClickhouseType>>> = vec![
            Arc::new(complex::ArrayMapper::new(deferred.clone())),
            Arc::new(complex::RestrictedNestedMapper::new(complex::NestedMapper::new(
                deferred.clone(),
            ))),
            Arc::new(complex::NullabilityAsDefaultMapper::new(deferred.clone())),
            Arc::new(complex::NullableMapper::new(deferred)),
        ];
        mappers.extend(primitives::primitive_mappers());

        CompositeMapper::new(CLICKHOUSE_MAPPER_NAME, mappers)
    });
    composite
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MappingError;
    use crate::warehouse::types::{DataType, Field, LogicalType};
    use std::collections::BTreeMap;

    fn map(logical: LogicalType) -> Result<ClickhouseType, MappingError> {
        clickhouse_mapper().logical_to_physical(&logical)
    }

    fn no_meta() -> Metadata {
        Metadata::new()
    }

    #[test]
    fn test_nullable_int64_becomes_default_column() {
        let ty = map(LogicalType::nullable(DataType::Int64)).unwrap();

        assert_eq!(ty.type_name, "Int64");
        assert_eq!(ty.column_modifiers, "DEFAULT");
        assert_eq!(ty.default_value, Some(Value::Int64(0)));
        assert_eq!(ty.default_sql_expression, "0");
        assert_eq!(ty.format(&Value::Null, &no_meta()).unwrap(), Value::Int64(0));
        assert_eq!(ty.format(&Value::Int64(42), &no_meta()).unwrap(), Value::Int64(42));
        assert_eq!(ty.column_definition("n"), "n Int64 DEFAULT 0");
    }

    #[test]
    fn test_list_of_struct_becomes_nested_with_defaults() {
        let logical = LogicalType::new(DataType::list_of(DataType::Struct(vec![
            Field::new("a", DataType::String, true),
            Field::new("b", DataType::Int32, true),
        ])));
        let ty = map(logical).unwrap();
        assert_eq!(ty.type_name, "Nested(a String, b Int32)");

        let mut first = BTreeMap::new();
        first.insert("a".to_string(), Value::from("x"));
        first.insert("b".to_string(), Value::Int32(1));
        let mut second = BTreeMap::new();
        second.insert("a".to_string(), Value::from("y"));

        let formatted = ty
            .format(&Value::List(vec![Value::Map(first.clone()), Value::Map(second.clone())]), &no_meta())
            .unwrap();

        second.insert("b".to_string(), Value::Int32(0));
        assert_eq!(formatted, Value::List(vec![Value::Map(first), Value::Map(second)]));
    }

    #[test]
    fn test_struct_of_struct_is_unsupported() {
        let inner = DataType::Struct(vec![Field::new("x", DataType::Int32, false)]);
        let logical = LogicalType::new(DataType::list_of(DataType::Struct(vec![Field::new(
            "a", inner, true,
        )])));

        let err = map(logical).unwrap_err();
        assert!(matches!(err, MappingError::Unsupported { ref mapper, .. } if mapper == "clickhouse"));
    }

    #[test]
    fn test_nullable_list_and_struct_are_unsupported() {
        let list = LogicalType::nullable(DataType::list_of(DataType::Int64));
        assert!(matches!(map(list), Err(MappingError::Unsupported { .. })));

        let structure = LogicalType::nullable(DataType::Struct(vec![Field::new("a", DataType::String, false)]));
        assert!(matches!(map(structure), Err(MappingError::Unsupported { .. })));

        let top_level = LogicalType::new(DataType::Struct(vec![Field::new("a", DataType::String, false)]));
        assert!(matches!(map(top_level), Err(MappingError::Unsupported { .. })));
    }

    #[test]
    fn test_int32_overflow() {
        let ty = map(LogicalType::new(DataType::Int32)).unwrap();
        assert_eq!(ty.format(&Value::Int64(7), &no_meta()).unwrap(), Value::Int32(7));

        let err = ty.format(&Value::Int64(i64::from(i32::MAX) + 1), &no_meta()).unwrap_err();
        assert!(matches!(err, FormatError::Overflow { target: "Int32", .. }));
    }

    #[test]
    fn test_array_of_primitives_and_nullable_elements() {
        let ty = map(LogicalType::new(DataType::list_of(DataType::String))).unwrap();
        assert_eq!(ty.type_name, "Array(String)");
        assert_eq!(
            ty.format(&Value::List(vec![Value::from("a")]), &no_meta()).unwrap(),
            Value::List(vec![Value::from("a")])
        );
        assert!(ty.format(&Value::List(vec![Value::Int32(1)]), &no_meta()).is_err());

        let ty = map(LogicalType::new(DataType::list_of(DataType::list_of(DataType::Int64)))).unwrap();
        assert_eq!(ty.type_name, "Array(Array(Int64))");
    }

    #[test]
    fn test_dual_date_default_representation() {
        let ty = map(LogicalType::nullable(DataType::Date32)).unwrap();
        assert_eq!(ty.default_sql_expression, "'1970-01-01'");
        assert!(matches!(ty.default_value, Some(Value::Time(_))));
        assert_eq!(ty.format(&Value::Null, &no_meta()).unwrap(), Value::from("1970-01-01"));

        let ty = map(LogicalType::nullable(DataType::TimestampSeconds)).unwrap();
        assert_eq!(ty.type_name, "DateTime64(0)");
        assert_eq!(ty.default_sql_expression, "'1970-01-01 00:00:00'");
        assert_eq!(ty.format(&Value::Null, &no_meta()).unwrap(), Value::from("1970-01-01 00:00:00"));
    }

    #[test]
    fn test_reverse_round_trip() {
        let mapper = clickhouse_mapper();
        let cases = vec![
            LogicalType::new(DataType::String),
            LogicalType::new(DataType::Int32),
            LogicalType::new(DataType::Int64),
            LogicalType::new(DataType::Float32),
            LogicalType::new(DataType::Float64),
            LogicalType::new(DataType::Boolean),
            LogicalType::new(DataType::Date32),
            LogicalType::new(DataType::TimestampSeconds),
            LogicalType::nullable(DataType::Int64),
            LogicalType::nullable(DataType::String),
            LogicalType::new(DataType::list_of(DataType::Float64)),
            LogicalType::new(DataType::list_of(DataType::Struct(vec![
                Field::new("key", DataType::String, true),
                Field::new("value", DataType::String, true),
            ]))),
        ];

        for logical in cases {
            let physical = mapper.logical_to_physical(&logical).unwrap();
            let read_back = ClickhouseType::physical(physical.type_name.clone())
                .with_modifiers(physical.column_modifiers.clone());
            assert_eq!(mapper.physical_to_logical(&read_back).unwrap(), logical, "{}", physical);
        }
    }

    #[test]
    fn test_reverse_accepts_aliases_and_nullable_wrapper() {
        let mapper = clickhouse_mapper();

        let logical = mapper.physical_to_logical(&ClickhouseType::physical("utf8")).unwrap();
        assert_eq!(logical, LogicalType::new(DataType::String));

        let logical = mapper.physical_to_logical(&ClickhouseType::physical("Nullable(Int32)")).unwrap();
        assert_eq!(logical, LogicalType::nullable(DataType::Int32));

        for unsupported in ["Nullable(Array(Int32))", "DateTime64(3)", "Decimal(10, 2)", "Array(Int8"] {
            assert!(
                matches!(
                    mapper.physical_to_logical(&ClickhouseType::physical(unsupported)),
                    Err(MappingError::Unsupported { .. })
                ),
                "{}",
                unsupported
            );
        }
    }
}
