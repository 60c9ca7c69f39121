//! Mappers for lists, structs and nullability
//!
//! Each holds a handle back into the full mapper graph for its element or
//! inner types.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::parser::{parse_type, TypeExpr};
use super::{ClickhouseType, CLICKHOUSE_MAPPER_NAME};
use crate::error::{FormatError, MappingError};
use crate::warehouse::mapper::TypeMapper;
use crate::warehouse::types::{DataType, Field, LogicalType, Metadata, Value};

type SubMapper = Arc<dyn TypeMapper<ClickhouseType>>;

fn unsupported_logical(logical: &LogicalType) -> MappingError {
    MappingError::unsupported_logical(CLICKHOUSE_MAPPER_NAME, logical.to_string())
}

fn unsupported_physical(physical: &ClickhouseType) -> MappingError {
    MappingError::unsupported_physical(CLICKHOUSE_MAPPER_NAME, physical.type_name.clone())
}

/// Parse failures are not fatal: the type is simply not ours
fn parse_physical(physical: &ClickhouseType) -> Result<TypeExpr, MappingError> {
    parse_type(&physical.type_name).map_err(|_| unsupported_physical(physical))
}

fn expect_list(value: &Value) -> Result<&[Value], FormatError> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(FormatError::TypeMismatch {
            expected: "list",
            got: other.kind().to_string(),
        }),
    }
}

fn field_error(field: &str, source: FormatError) -> FormatError {
    FormatError::Field {
        field: field.to_string(),
        source: Box::new(source),
    }
}

/// Map each struct field through the graph, keeping field order
fn map_fields(sub: &SubMapper, fields: &[Field]) -> Result<Vec<(String, ClickhouseType)>, MappingError> {
    fields
        .iter()
        .map(|field| Ok((field.name.clone(), sub.logical_to_physical(&LogicalType::from(field))?)))
        .collect()
}

fn nested_type_name(fields: &[(String, ClickhouseType)]) -> String {
    let defs: Vec<String> = fields
        .iter()
        .map(|(name, ty)| format!("{} {}", name, ty.type_name))
        .collect();
    format!("Nested({})", defs.join(", "))
}

/// Format one struct value. Missing keys go through the field formatter as null.
fn format_record(
    fields: &[(String, ClickhouseType)],
    value: &Value,
    metadata: &Metadata,
) -> Result<Value, FormatError> {
    let Value::Map(record) = value else {
        return Err(FormatError::TypeMismatch {
            expected: "map",
            got: value.kind().to_string(),
        });
    };

    let mut out = BTreeMap::new();
    for (name, ty) in fields {
        let raw = record.get(name).unwrap_or(&Value::Null);
        let formatted = ty.format(raw, metadata).map_err(|e| field_error(name, e))?;
        out.insert(name.clone(), formatted);
    }
    Ok(Value::Map(out))
}

/// Nested fields read back from a table are always nullable
fn physical_fields(sub: &SubMapper, expr: &TypeExpr, physical: &ClickhouseType) -> Result<Vec<Field>, MappingError> {
    expr.args
        .iter()
        .map(|arg| {
            let name = arg.name.clone().ok_or_else(|| unsupported_physical(physical))?;
            let logical = sub.physical_to_logical(&ClickhouseType::physical(arg.ty.to_string()))?;
            Ok(Field::new(name, logical.data_type, true))
        })
        .collect()
}

/// `list<T>` to `Array(T)`, and `list<struct>` to `Nested(...)`
pub(super) struct ArrayMapper {
    sub: SubMapper,
}

impl ArrayMapper {
    pub(super) fn new(sub: SubMapper) -> Self {
        Self { sub }
    }

    fn list_of_struct(&self, logical: &LogicalType, fields: &[Field]) -> Result<ClickhouseType, MappingError> {
        // one level of nesting only
        if fields.iter().any(|f| !f.data_type.is_primitive()) {
            return Err(unsupported_logical(logical));
        }

        let mapped = map_fields(&self.sub, fields)?;
        let type_name = nested_type_name(&mapped);
        Ok(ClickhouseType::new(
            type_name,
            Arc::new(move |value: &Value, metadata: &Metadata| {
                expect_list(value)?
                    .iter()
                    .map(|record| format_record(&mapped, record, metadata))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List)
            }),
        ))
    }

    fn list_of(&self, element: &DataType) -> Result<ClickhouseType, MappingError> {
        let element = self.sub.logical_to_physical(&LogicalType::new(element.clone()))?;
        Ok(ClickhouseType::new(
            format!("Array({})", element.type_name),
            Arc::new(move |value: &Value, metadata: &Metadata| {
                expect_list(value)?
                    .iter()
                    .enumerate()
                    .map(|(i, item)| element.format(item, metadata).map_err(|e| field_error(&format!("[{}]", i), e)))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List)
            }),
        ))
    }
}

impl TypeMapper<ClickhouseType> for ArrayMapper {
    fn logical_to_physical(&self, logical: &LogicalType) -> Result<ClickhouseType, MappingError> {
        let DataType::List(element) = &logical.data_type else {
            return Err(unsupported_logical(logical));
        };
        if logical.nullable {
            return Err(unsupported_logical(logical));
        }

        match element.as_ref() {
            DataType::Struct(fields) => self.list_of_struct(logical, fields),
            other => self.list_of(other),
        }
    }

    fn physical_to_logical(&self, physical: &ClickhouseType) -> Result<LogicalType, MappingError> {
        let expr = parse_physical(physical)?;
        match expr.name.as_str() {
            "Nested" => {
                let fields = physical_fields(&self.sub, &expr, physical)?;
                Ok(LogicalType::new(DataType::list_of(DataType::Struct(fields))))
            }
            "Array" => {
                let element = expr.single_arg().ok_or_else(|| unsupported_physical(physical))?;
                let logical = self.sub.physical_to_logical(&ClickhouseType::physical(element.to_string()))?;
                Ok(LogicalType::new(DataType::list_of(logical.data_type)))
            }
            _ => Err(unsupported_physical(physical)),
        }
    }
}

/// `struct` to `Nested(...)` for a single record
pub(super) struct NestedMapper {
    sub: SubMapper,
}

impl NestedMapper {
    pub(super) fn new(sub: SubMapper) -> Self {
        Self { sub }
    }
}

impl TypeMapper<ClickhouseType> for NestedMapper {
    fn logical_to_physical(&self, logical: &LogicalType) -> Result<ClickhouseType, MappingError> {
        let DataType::Struct(fields) = &logical.data_type else {
            return Err(unsupported_logical(logical));
        };
        if fields.iter().any(|f| !f.data_type.is_primitive()) {
            return Err(unsupported_logical(logical));
        }

        let mapped = map_fields(&self.sub, fields)?;
        Ok(ClickhouseType::new(
            nested_type_name(&mapped),
            Arc::new(move |value: &Value, metadata: &Metadata| format_record(&mapped, value, metadata)),
        ))
    }

    fn physical_to_logical(&self, physical: &ClickhouseType) -> Result<LogicalType, MappingError> {
        let expr = parse_physical(physical)?;
        if expr.name != "Nested" {
            return Err(unsupported_physical(physical));
        }
        Ok(LogicalType::new(DataType::Struct(physical_fields(&self.sub, &expr, physical)?)))
    }
}

/// Rejects structs outside a list, which the warehouse cannot store
pub(super) struct RestrictedNestedMapper {
    inner: NestedMapper,
}

impl RestrictedNestedMapper {
    pub(super) fn new(inner: NestedMapper) -> Self {
        Self { inner }
    }
}

impl TypeMapper<ClickhouseType> for RestrictedNestedMapper {
    fn logical_to_physical(&self, logical: &LogicalType) -> Result<ClickhouseType, MappingError> {
        if logical.data_type.is_struct() {
            return Err(unsupported_logical(logical));
        }
        self.inner.logical_to_physical(logical)
    }

    fn physical_to_logical(&self, physical: &ClickhouseType) -> Result<LogicalType, MappingError> {
        self.inner.physical_to_logical(physical)
    }
}

/// Nullable scalar to a NOT NULL column with a `DEFAULT`; null formats as the default
pub(super) struct NullabilityAsDefaultMapper {
    sub: SubMapper,
}

impl NullabilityAsDefaultMapper {
    pub(super) fn new(sub: SubMapper) -> Self {
        Self { sub }
    }
}

impl TypeMapper<ClickhouseType> for NullabilityAsDefaultMapper {
    fn logical_to_physical(&self, logical: &LogicalType) -> Result<ClickhouseType, MappingError> {
        if !logical.nullable || !logical.data_type.is_primitive() {
            return Err(unsupported_logical(logical));
        }

        let inner = self.sub.logical_to_physical(&logical.with_nullable(false))?;
        let Some(default_value) = inner.default_value.clone() else {
            return Err(unsupported_logical(logical));
        };

        let format_inner = inner.clone();
        let mut ty = ClickhouseType::new(
            inner.type_name.clone(),
            Arc::new(move |value: &Value, metadata: &Metadata| {
                if value.is_null() {
                    format_inner.format(&default_value, metadata)
                } else {
                    format_inner.format(value, metadata)
                }
            }),
        )
        .with_modifiers(super::DEFAULT_MODIFIER);
        ty.default_value = inner.default_value;
        ty.default_sql_expression = inner.default_sql_expression;
        Ok(ty)
    }

    fn physical_to_logical(&self, physical: &ClickhouseType) -> Result<LogicalType, MappingError> {
        if !physical.has_default_modifier() {
            return Err(unsupported_physical(physical));
        }
        let bare = ClickhouseType::physical(physical.type_name.clone());
        Ok(self.sub.physical_to_logical(&bare)?.with_nullable(true))
    }
}

/// Remaining nullable non-list types to `Nullable(T)`; null passes through
pub(super) struct NullableMapper {
    sub: SubMapper,
}

impl NullableMapper {
    pub(super) fn new(sub: SubMapper) -> Self {
        Self { sub }
    }
}

impl TypeMapper<ClickhouseType> for NullableMapper {
    fn logical_to_physical(&self, logical: &LogicalType) -> Result<ClickhouseType, MappingError> {
        if !logical.nullable || !logical.data_type.is_primitive() {
            return Err(unsupported_logical(logical));
        }

        let inner = self.sub.logical_to_physical(&logical.with_nullable(false))?;
        let type_name = format!("Nullable({})", inner.type_name);
        Ok(ClickhouseType::new(
            type_name,
            Arc::new(move |value: &Value, metadata: &Metadata| {
                if value.is_null() {
                    Ok(Value::Null)
                } else {
                    inner.format(value, metadata)
                }
            }),
        ))
    }

    fn physical_to_logical(&self, physical: &ClickhouseType) -> Result<LogicalType, MappingError> {
        let expr = parse_physical(physical)?;
        if expr.name != "Nullable" {
            return Err(unsupported_physical(physical));
        }
        let inner = expr.single_arg().ok_or_else(|| unsupported_physical(physical))?;
        if inner.name == "Array" || inner.name == "Nested" {
            return Err(unsupported_physical(physical));
        }
        let logical = self.sub.physical_to_logical(&ClickhouseType::physical(inner.to_string()))?;
        Ok(logical.with_nullable(true))
    }
}
